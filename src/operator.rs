//! The closed set of operators the front end may emit.
//!
//! Every operator declares its effects on signals in four sets. A signal is
//! *set* by an operator that overwrites it, *incremented* by one that adds to
//! it, *read* by one that consumes it, and *updated* by one that computes its
//! value for the next step.

use std::fmt;

use rkyv::{Archive, Deserialize, Serialize};

use crate::{host::HostFunction, signal::Signal};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NeuronType {
    Lif { tau_rc: f64, tau_ref: f64 },
    LifRate { tau_rc: f64, tau_ref: f64 },
    RectifiedLinear,
    Sigmoid { tau_ref: f64 },
    AdaptiveLif { tau_rc: f64, tau_ref: f64, tau_n: f64, inc_n: f64 },
    Izhikevich { tau_recovery: f64, coupling: f64, reset_voltage: f64 },
}

impl NeuronType {
    pub fn name(&self) -> &'static str {
        match self {
            NeuronType::Lif { .. } => "LIF",
            NeuronType::LifRate { .. } => "LIFRate",
            NeuronType::RectifiedLinear => "RectifiedLinear",
            NeuronType::Sigmoid { .. } => "Sigmoid",
            NeuronType::AdaptiveLif { .. } => "AdaptiveLIF",
            NeuronType::Izhikevich { .. } => "Izhikevich",
        }
    }
}

/// Continuous-time synapse models. Transfer functions are given as numerator
/// and denominator coefficients in descending powers of `s`.
#[derive(Debug, Clone, PartialEq)]
pub enum Synapse {
    LinearFilter { num: Vec<f64>, den: Vec<f64> },
    Lowpass { tau: f64 },
    Alpha { tau: f64 },
    Triangle { t: f64 },
}

impl Synapse {
    pub fn name(&self) -> &'static str {
        match self {
            Synapse::LinearFilter { .. } => "LinearFilter",
            Synapse::Lowpass { .. } => "Lowpass",
            Synapse::Alpha { .. } => "Alpha",
            Synapse::Triangle { .. } => "Triangle",
        }
    }

    /// The continuous transfer function, if this synapse is a linear filter.
    pub fn transfer_function(&self) -> Option<(Vec<f64>, Vec<f64>)> {
        match self {
            Synapse::LinearFilter { num, den } => Some((num.clone(), den.clone())),
            Synapse::Lowpass { tau } => Some((vec![1.], vec![*tau, 1.])),
            Synapse::Alpha { tau } => {
                Some((vec![1.], vec![tau * tau, 2. * tau, 1.]))
            }
            Synapse::Triangle { .. } => None,
        }
    }
}

/// Which elements of a vector a `SlicedCopy` touches.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[archive(check_bytes)]
pub enum Slice {
    Full,
    Range { start: u64, stop: u64, step: u64 },
    Indices(Vec<u64>),
}

impl fmt::Display for Slice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slice::Full => write!(f, ":"),
            Slice::Range { start, stop, step } => {
                write!(f, "{}:{}:{}", start, stop, step)
            }
            Slice::Indices(indices) => {
                write!(f, "[")?;
                for (i, index) in indices.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", index)?;
                }
                write!(f, "]")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum Operator {
    Reset {
        dst: Signal,
        value: f64,
    },
    Copy {
        dst: Signal,
        src: Signal,
    },
    SlicedCopy {
        src: Signal,
        dst: Signal,
        src_slice: Slice,
        dst_slice: Slice,
        inc: bool,
    },
    /// `y += a . x`
    DotInc {
        a: Signal,
        x: Signal,
        y: Signal,
    },
    /// `y += a * x`
    ElementwiseInc {
        a: Signal,
        x: Signal,
        y: Signal,
    },
    SimNeurons {
        neurons: NeuronType,
        j: Signal,
        output: Signal,
        states: Vec<Signal>,
    },
    SimSynapse {
        synapse: Synapse,
        input: Signal,
        output: Signal,
    },
    HostFunc {
        function: HostFunction,
        t_in: bool,
        input: Option<Signal>,
        output: Option<Signal>,
    },
    /// Keeps a signal alive across steps. Has no runtime behavior.
    PreserveValue {
        dst: Signal,
    },
    SimBcm {
        pre_filtered: Signal,
        post_filtered: Signal,
        theta: Signal,
        delta: Signal,
    },
    SimOja {
        pre_filtered: Signal,
        post_filtered: Signal,
        weights: Signal,
        delta: Signal,
    },
    Send {
        signal: Signal,
        dst: u32,
    },
    Recv {
        signal: Signal,
        src: u32,
    },
    /// Gate placed before the first local read of a transferred signal.
    Wait {
        signal: Signal,
    },
}

/// The signals an operator touches, by kind of effect.
#[derive(Debug, Default)]
pub struct Effects<'a> {
    pub sets: Vec<&'a Signal>,
    pub incs: Vec<&'a Signal>,
    pub reads: Vec<&'a Signal>,
    pub updates: Vec<&'a Signal>,
}

impl<'a> Effects<'a> {
    /// Signals set or incremented.
    pub fn writes(&self) -> impl Iterator<Item = &'a Signal> + '_ {
        self.sets.iter().chain(&self.incs).copied()
    }

    pub fn all(&self) -> impl Iterator<Item = &'a Signal> + '_ {
        self.sets
            .iter()
            .chain(&self.incs)
            .chain(&self.reads)
            .chain(&self.updates)
            .copied()
    }
}

impl Operator {
    pub fn name(&self) -> &'static str {
        match self {
            Operator::Reset { .. } => "Reset",
            Operator::Copy { .. } => "Copy",
            Operator::SlicedCopy { .. } => "SlicedCopy",
            Operator::DotInc { .. } => "DotInc",
            Operator::ElementwiseInc { .. } => "ElementwiseInc",
            Operator::SimNeurons { .. } => "SimNeurons",
            Operator::SimSynapse { .. } => "SimSynapse",
            Operator::HostFunc { .. } => "HostFunc",
            Operator::PreserveValue { .. } => "PreserveValue",
            Operator::SimBcm { .. } => "SimBCM",
            Operator::SimOja { .. } => "SimOja",
            Operator::Send { .. } => "Send",
            Operator::Recv { .. } => "Recv",
            Operator::Wait { .. } => "Wait",
        }
    }

    pub fn effects(&self) -> Effects<'_> {
        let mut e = Effects::default();
        match self {
            Operator::Reset { dst, .. } => e.sets.push(dst),
            Operator::Copy { dst, src } => {
                e.sets.push(dst);
                e.reads.push(src);
            }
            Operator::SlicedCopy { src, dst, inc, .. } => {
                if *inc {
                    e.incs.push(dst);
                } else {
                    e.sets.push(dst);
                }
                e.reads.push(src);
            }
            Operator::DotInc { a, x, y } | Operator::ElementwiseInc { a, x, y } => {
                e.incs.push(y);
                e.reads.extend([a, x]);
            }
            Operator::SimNeurons {
                j, output, states, ..
            } => {
                e.sets.push(output);
                e.sets.extend(states);
                e.reads.push(j);
            }
            Operator::SimSynapse { input, output, .. } => {
                e.reads.push(input);
                e.updates.push(output);
            }
            Operator::HostFunc { input, output, .. } => {
                e.sets.extend(output);
                e.reads.extend(input);
            }
            Operator::PreserveValue { dst } => e.updates.push(dst),
            Operator::SimBcm {
                pre_filtered,
                post_filtered,
                theta,
                delta,
            } => {
                e.incs.push(delta);
                e.reads.extend([pre_filtered, post_filtered, theta]);
            }
            Operator::SimOja {
                pre_filtered,
                post_filtered,
                weights,
                delta,
            } => {
                e.incs.push(delta);
                e.reads.extend([pre_filtered, post_filtered, weights]);
            }
            // inserted after ordering, so they take no part in it
            Operator::Send { .. } | Operator::Recv { .. } => {}
            Operator::Wait { signal } => e.sets.push(signal),
        }
        e
    }

    /// Every signal the operator touches, without duplicates.
    pub fn signals(&self) -> Vec<&Signal> {
        let effects = self.effects();
        let mut signals: Vec<&Signal> = Vec::new();
        let extra = match self {
            Operator::Send { signal, .. } | Operator::Recv { signal, .. } => {
                Some(signal)
            }
            _ => None,
        };
        for signal in effects.all().chain(extra) {
            if !signals.iter().any(|s| s.key() == signal.key()) {
                signals.push(signal);
            }
        }
        signals
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(
            self,
            Operator::Send { .. } | Operator::Recv { .. } | Operator::Wait { .. }
        )
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())?;
        match self {
            Operator::SimNeurons { neurons, .. } => {
                write!(f, "<{}>", neurons.name())?
            }
            Operator::SimSynapse { synapse, .. } => {
                write!(f, "<{}>", synapse.name())?
            }
            Operator::HostFunc { function, .. } => {
                write!(f, "<{}>", function.name())?
            }
            _ => {}
        }
        write!(f, "(")?;
        for (i, signal) in self.signals().into_iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", signal)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synapse_updates_its_output() {
        let input = Signal::zeros("in", &[2]);
        let output = Signal::zeros("out", &[2]);
        let op = Operator::SimSynapse {
            synapse: Synapse::Lowpass { tau: 0.005 },
            input: input.clone(),
            output: output.clone(),
        };
        let effects = op.effects();
        assert_eq!(effects.reads[0].key(), input.key());
        assert_eq!(effects.updates[0].key(), output.key());
        assert!(effects.sets.is_empty() && effects.incs.is_empty());
    }

    #[test]
    fn sliced_copy_mode_selects_effect() {
        let src = Signal::zeros("src", &[4]);
        let dst = Signal::zeros("dst", &[2]);
        let copy = |inc| Operator::SlicedCopy {
            src: src.clone(),
            dst: dst.clone(),
            src_slice: Slice::Range {
                start: 0,
                stop: 4,
                step: 2,
            },
            dst_slice: Slice::Full,
            inc,
        };
        assert_eq!(copy(true).effects().incs.len(), 1);
        assert_eq!(copy(false).effects().sets.len(), 1);
    }

    #[test]
    fn signals_are_deduplicated_by_buffer() {
        let x = Signal::zeros("x", &[3]);
        let op = Operator::ElementwiseInc {
            a: x.clone(),
            x: x.slice(0, 3).unwrap(),
            y: Signal::zeros("y", &[3]),
        };
        assert_eq!(op.signals().len(), 2);
        assert!(op.to_string().starts_with("ElementwiseInc(y("));
    }

    #[test]
    fn transfer_functions() {
        assert_eq!(
            Synapse::Lowpass { tau: 0.1 }.transfer_function(),
            Some((vec![1.], vec![0.1, 1.]))
        );
        assert!(Synapse::Triangle { t: 0.1 }.transfer_function().is_none());
        assert_eq!(
            Slice::Indices(vec![0, 3, 1]).to_string(),
            "[0,3,1]"
        );
    }
}
