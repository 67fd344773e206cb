//! Conversion of ordered operators into portable records for the execution
//! engine.

pub mod filter;
pub mod wire;

use std::fmt;

use rkyv::{Archive, Deserialize, Serialize};
use tracing::{debug, debug_span, warn};

use crate::{
    error::{ConfigError, Result},
    host::{HostBinding, HostFunctionTable},
    operator::{NeuronType, Operator, Slice},
    registry::PartitionStore,
    signal::Signal,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[archive(check_bytes)]
pub enum OpTag {
    Reset,
    Copy,
    SlicedCopy,
    DotInc,
    ElementwiseInc,
    Lif,
    LifRate,
    RectifiedLinear,
    Sigmoid,
    LinearFilter,
    HostFunc,
    Send,
    Recv,
    Wait,
}

impl OpTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpTag::Reset => "Reset",
            OpTag::Copy => "Copy",
            OpTag::SlicedCopy => "SlicedCopy",
            OpTag::DotInc => "DotInc",
            OpTag::ElementwiseInc => "ElementwiseInc",
            OpTag::Lif => "LIF",
            OpTag::LifRate => "LIFRate",
            OpTag::RectifiedLinear => "RectifiedLinear",
            OpTag::Sigmoid => "Sigmoid",
            OpTag::LinearFilter => "LinearFilter",
            OpTag::HostFunc => "HostFunc",
            OpTag::Send => "Send",
            OpTag::Recv => "Recv",
            OpTag::Wait => "Wait",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[archive(check_bytes)]
pub enum Operand {
    Signal(u64),
    Partition(u32),
    Scalar(f64),
    Count(u64),
    Flag(bool),
    Coefficients(Vec<f64>),
    Slice(Slice),
    HostFunction(u32),
    Absent,
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Signal(key) => write!(f, "{}", key),
            Operand::Partition(p) => write!(f, "{}", p),
            Operand::Scalar(x) => write!(f, "{}", x),
            Operand::Count(n) => write!(f, "{}", n),
            Operand::Flag(b) => write!(f, "{}", *b as u8),
            Operand::Coefficients(c) => {
                write!(f, "[")?;
                for (i, x) in c.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", x)?;
                }
                write!(f, "]")
            }
            Operand::Slice(s) => write!(f, "{}", s),
            Operand::HostFunction(i) => write!(f, "{}", i),
            Operand::Absent => write!(f, "-1"),
        }
    }
}

/// One operator as the execution engine sees it. Displays as the
/// `;`-delimited tuple `tag;operand;...`.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[archive(check_bytes)]
pub struct OpRecord {
    pub tag: OpTag,
    pub operands: Vec<Operand>,
}

impl OpRecord {
    fn new(tag: OpTag, operands: Vec<Operand>) -> Self {
        Self { tag, operands }
    }

    /// Keys of every signal operand.
    pub fn signal_keys(&self) -> impl Iterator<Item = u64> + '_ {
        self.operands.iter().filter_map(|o| match o {
            Operand::Signal(key) => Some(*key),
            _ => None,
        })
    }
}

impl fmt::Display for OpRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag.as_str())?;
        for operand in &self.operands {
            write!(f, ";{}", operand)?;
        }
        Ok(())
    }
}

fn sig(signal: &Signal) -> Operand {
    Operand::Signal(signal.key().get())
}

/// What lowering needs beyond the operator itself.
pub struct LoweringContext<'a> {
    pub partition: u32,
    pub dt: f64,
    pub filter_skip_ratio: f64,
    /// Signals transmitted to this partition, for host-function inputs.
    pub store: Option<&'a PartitionStore>,
    pub host_functions: &'a mut HostFunctionTable,
}

/// Lowers one operator. Returns `None` for operators with no runtime
/// behavior.
pub fn lower_operator(
    op: &Operator,
    ctx: &mut LoweringContext<'_>,
) -> Result<Option<OpRecord>> {
    let record = match op {
        Operator::Reset { dst, value } => {
            OpRecord::new(OpTag::Reset, vec![sig(dst), Operand::Scalar(*value)])
        }
        Operator::Copy { dst, src } => {
            OpRecord::new(OpTag::Copy, vec![sig(dst), sig(src)])
        }
        Operator::SlicedCopy {
            src,
            dst,
            src_slice,
            dst_slice,
            inc,
        } => OpRecord::new(
            OpTag::SlicedCopy,
            vec![
                sig(src),
                sig(dst),
                Operand::Slice(src_slice.clone()),
                Operand::Slice(dst_slice.clone()),
                Operand::Flag(*inc),
            ],
        ),
        Operator::DotInc { a, x, y } => {
            OpRecord::new(OpTag::DotInc, vec![sig(a), sig(x), sig(y)])
        }
        Operator::ElementwiseInc { a, x, y } => {
            OpRecord::new(OpTag::ElementwiseInc, vec![sig(a), sig(x), sig(y)])
        }
        Operator::SimNeurons {
            neurons, j, output, ..
        } => {
            let n = Operand::Count(j.size() as u64);
            match *neurons {
                NeuronType::Lif { tau_rc, tau_ref } => OpRecord::new(
                    OpTag::Lif,
                    vec![
                        n,
                        Operand::Scalar(tau_rc),
                        Operand::Scalar(tau_ref),
                        Operand::Scalar(ctx.dt),
                        sig(j),
                        sig(output),
                    ],
                ),
                NeuronType::LifRate { tau_rc, tau_ref } => OpRecord::new(
                    OpTag::LifRate,
                    vec![n, Operand::Scalar(tau_rc), Operand::Scalar(tau_ref), sig(j), sig(output)],
                ),
                NeuronType::RectifiedLinear => OpRecord::new(
                    OpTag::RectifiedLinear,
                    vec![n, sig(j), sig(output)],
                ),
                NeuronType::Sigmoid { tau_ref } => OpRecord::new(
                    OpTag::Sigmoid,
                    vec![n, Operand::Scalar(tau_ref), sig(j), sig(output)],
                ),
                other => Err(ConfigError::Unsupported {
                    kind: "neuron type",
                    name: other.name().into(),
                })?,
            }
        }
        Operator::SimSynapse {
            synapse,
            input,
            output,
        } => {
            let coeffs =
                match filter::coefficients(synapse, ctx.dt, ctx.filter_skip_ratio)?
                {
                    Some(coeffs) => coeffs,
                    None => Err(ConfigError::Unsupported {
                        kind: "synapse",
                        name: synapse.name().into(),
                    })?,
                };
            OpRecord::new(
                OpTag::LinearFilter,
                vec![
                    sig(input),
                    sig(output),
                    Operand::Coefficients(coeffs.num),
                    Operand::Coefficients(coeffs.den),
                ],
            )
        }
        Operator::HostFunc {
            function,
            t_in,
            input,
            output,
        } => {
            let input = input.as_ref().map(|x| (x.key(), host_input(x, ctx)));
            let index = ctx.host_functions.push(HostBinding {
                function: function.clone(),
                t_in: *t_in,
                input: input.clone(),
                output: output.as_ref().map(Signal::key),
                partition: ctx.partition,
            });
            OpRecord::new(
                OpTag::HostFunc,
                vec![
                    Operand::HostFunction(index),
                    Operand::Flag(*t_in),
                    input.map_or(Operand::Absent, |(key, _)| Operand::Signal(key.get())),
                    output.as_ref().map_or(Operand::Absent, sig),
                ],
            )
        }
        Operator::PreserveValue { dst } => {
            debug!("skipping PreserveValue of {}", dst);
            return Ok(None);
        }
        Operator::SimBcm { .. } | Operator::SimOja { .. } => {
            Err(ConfigError::Unsupported {
                kind: "operator",
                name: op.name().into(),
            })?
        }
        Operator::Send { signal, dst } => {
            OpRecord::new(OpTag::Send, vec![Operand::Partition(*dst), sig(signal)])
        }
        Operator::Recv { signal, src } => {
            OpRecord::new(OpTag::Recv, vec![Operand::Partition(*src), sig(signal)])
        }
        Operator::Wait { signal } => OpRecord::new(OpTag::Wait, vec![sig(signal)]),
    };
    Ok(Some(record))
}

/// Initial contents of a host function's input, taken from the partition's
/// copy of the signal. Zeros if the partition holds no copy.
fn host_input(input: &Signal, ctx: &LoweringContext<'_>) -> Vec<f64> {
    let payload = ctx.store.and_then(|store| store.get(input.key()));
    match payload {
        Some(payload) => input.gather(&payload.data),
        None => {
            warn!(
                "host function input {} has no copy in partition {}, using zeros",
                input, ctx.partition
            );
            vec![0.; input.size()]
        }
    }
}

/// Lowers a partition's ordered operators.
pub fn lower_partition(
    ops: &[Operator],
    ctx: &mut LoweringContext<'_>,
) -> Result<Vec<OpRecord>> {
    let span = debug_span!("partition", id = ctx.partition);
    let _guard = span.enter();
    let mut records = Vec::with_capacity(ops.len());
    for op in ops {
        if let Some(record) = lower_operator(op, ctx)? {
            records.push(record);
        }
    }
    debug!("lowered {} operators into {} records", ops.len(), records.len());
    Ok(records)
}
