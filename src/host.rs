//! Host functions: user closures run by the execution engine on behalf of a
//! node. Their outputs are checked and normalized before they reach a signal.

use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::signal::SignalKey;

/// Arguments passed to a host function. `t` is present when the function
/// takes time, `x` when it takes an input signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostArgs<'a> {
    pub t: Option<f64>,
    pub x: Option<&'a [f64]>,
}

/// Whatever a host function chose to return.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    None,
    Int(i64),
    Float(f64),
    List(Vec<f64>),
    Array { shape: Vec<usize>, data: Vec<f64> },
}

/// A host function output after normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum Checked {
    Scalar(f64),
    Array { shape: Vec<usize>, data: Vec<f64> },
}

#[derive(Debug, Error, PartialEq)]
pub enum HostValueError {
    #[error("host function {0} returned no value")]
    Missing(String),
    #[error("host function {name} returned shape {shape:?} with {len} elements")]
    Malformed {
        name: String,
        shape: Vec<usize>,
        len: usize,
    },
}

type HostFn = dyn Fn(&HostArgs<'_>) -> HostValue + Send + Sync;

/// A named host closure.
#[derive(Clone)]
pub struct HostFunction {
    name: String,
    f: Arc<HostFn>,
}

impl HostFunction {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&HostArgs<'_>) -> HostValue + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Arc::new(f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Calls the raw closure without normalizing its result.
    pub fn call_raw(&self, args: &HostArgs<'_>) -> HostValue {
        (self.f)(args)
    }

    /// Calls the closure and normalizes its result: integers become floats,
    /// lists become arrays, arrays are squeezed and single elements collapse
    /// to scalars.
    pub fn call(&self, args: &HostArgs<'_>) -> Result<Checked, HostValueError> {
        check_output(&self.name, self.call_raw(args))
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostFunction({})", self.name)
    }
}

pub fn check_output(
    name: &str,
    value: HostValue,
) -> Result<Checked, HostValueError> {
    let (shape, data) = match value {
        HostValue::None => return Err(HostValueError::Missing(name.into())),
        HostValue::Int(i) => return Ok(Checked::Scalar(i as f64)),
        HostValue::Float(x) => return Ok(Checked::Scalar(x)),
        HostValue::List(data) => (vec![data.len()], data),
        HostValue::Array { shape, data } => (shape, data),
    };
    if shape.iter().product::<usize>() != data.len() {
        return Err(HostValueError::Malformed {
            name: name.into(),
            len: data.len(),
            shape,
        });
    }
    if data.len() == 1 {
        return Ok(Checked::Scalar(data[0]));
    }
    let shape = shape.into_iter().filter(|&d| d != 1).collect();
    Ok(Checked::Array { shape, data })
}

/// How the execution engine should invoke one host function.
#[derive(Debug, Clone)]
pub struct HostBinding {
    pub function: HostFunction,
    pub t_in: bool,
    /// Input key and the initial contents of the input buffer.
    pub input: Option<(SignalKey, Vec<f64>)>,
    pub output: Option<SignalKey>,
    pub partition: u32,
}

impl HostBinding {
    /// Invokes the function with the arguments its binding declares.
    pub fn invoke(
        &self,
        t: f64,
        x: &[f64],
    ) -> Result<Checked, HostValueError> {
        let args = HostArgs {
            t: self.t_in.then_some(t),
            x: self.input.as_ref().map(|_| x),
        };
        self.function.call(&args)
    }
}

/// Host functions referenced by `HostFunc` records, by index.
#[derive(Debug, Clone, Default)]
pub struct HostFunctionTable {
    bindings: Vec<HostBinding>,
}

impl HostFunctionTable {
    pub(crate) fn push(&mut self, binding: HostBinding) -> u32 {
        self.bindings.push(binding);
        (self.bindings.len() - 1) as u32
    }

    pub fn get(&self, index: u32) -> Option<&HostBinding> {
        self.bindings.get(index as usize)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostBinding> {
        self.bindings.iter()
    }
}
