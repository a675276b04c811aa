//! Host implementation of the sparse dispatch operators.
//!
//! A routing assigns sample `i` to expert `indices[i]` at slot
//! `locations[i]`. Samples with a negative expert or a slot at or past the
//! capacity are dropped. With `hidden` features per sample, the dispatched
//! buffer is `[experts, capacity, hidden]` and sample `i` maps onto row
//! `indices[i] * capacity + locations[i]`.

use std::ops::{Add, AddAssign, Mul};

use candle_core::{DType, WithDType};

use super::{OpsError, Result};
use crate::buffer::DeviceBuffer;

/// Element types the operators are provided for.
pub trait SparseElement:
    WithDType + Default + Add<Output = Self> + Mul<Output = Self> + AddAssign
{
}

impl SparseElement for f32 {}
impl SparseElement for f64 {}

/// Problem extents shared by the three operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchShape {
    pub samples: usize,
    pub hidden: usize,
    pub capacity: usize,
}

/// Which operator to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SparseKernel {
    /// `dispatched[row] += gate * input`
    Forward,
    /// `input = gate * dispatched[row]`, zero for dropped samples
    BackwardData,
    /// `gate = dot(dispatched[row], input)`, zero for dropped samples
    BackwardGate,
}

impl SparseKernel {
    fn name(self) -> &'static str {
        match self {
            Self::Forward => "sparse_forward",
            Self::BackwardData => "sparse_backward_data",
            Self::BackwardGate => "sparse_backward_gate",
        }
    }
}

/// Validated routing of `shape.samples` samples into a dispatched buffer of
/// `dispatched_len` values.
#[derive(Debug, Clone)]
pub struct Routing<'a> {
    indices: &'a [i64],
    locations: &'a [i64],
    shape: DispatchShape,
}

impl<'a> Routing<'a> {
    pub fn new(
        op: &'static str,
        indices: &'a [i64],
        locations: &'a [i64],
        shape: DispatchShape,
        dispatched_len: usize,
    ) -> Result<Self> {
        for len in [indices.len(), locations.len()] {
            if len < shape.samples {
                return Err(OpsError::ShapeMismatch {
                    op,
                    expected: vec![shape.samples],
                    actual: vec![len],
                });
            }
        }
        let routing = Self {
            indices,
            locations,
            shape,
        };
        for sample in 0..shape.samples {
            let Some((index, location)) = routing.kept(sample) else {
                continue;
            };
            let end = row_offset(index, location, shape)
                .and_then(|offset| offset.checked_add(shape.hidden).map(|end| (offset, end)));
            match end {
                Some((_, end)) if end <= dispatched_len => {}
                other => {
                    return Err(OpsError::IndexOutOfRange {
                        op,
                        sample,
                        offset: other.map_or(usize::MAX, |(offset, _)| offset),
                        len: dispatched_len,
                    })
                }
            }
        }
        Ok(routing)
    }

    /// Expert index and slot of `sample`, or `None` if it is dropped.
    fn kept(&self, sample: usize) -> Option<(i64, usize)> {
        let (index, location) = (self.indices[sample], self.locations[sample]);
        if index < 0 || location < 0 || location >= self.shape.capacity as i64 {
            return None;
        }
        Some((index, location as usize))
    }

    /// First value of the dispatched row of `sample`, or `None` if dropped.
    pub fn row(&self, sample: usize) -> Option<usize> {
        let (index, location) = self.kept(sample)?;
        row_offset(index, location, self.shape)
    }

    pub fn shape(&self) -> DispatchShape {
        self.shape
    }
}

/// `(index * capacity + location) * hidden`, or `None` on overflow.
fn row_offset(index: i64, location: usize, shape: DispatchShape) -> Option<usize> {
    usize::try_from(index)
        .ok()?
        .checked_mul(shape.capacity)?
        .checked_add(location)?
        .checked_mul(shape.hidden)
}

fn check_len(op: &'static str, len: usize, needed: usize) -> Result<()> {
    if len < needed {
        return Err(OpsError::ShapeMismatch {
            op,
            expected: vec![needed],
            actual: vec![len],
        });
    }
    Ok(())
}

/// Scatter gated samples into their expert slots.
pub fn encode_forward<T: SparseElement>(
    routing: &Routing<'_>,
    gates: &[T],
    input: &[T],
    dispatched: &mut [T],
) -> Result<()> {
    let DispatchShape { samples, hidden, .. } = routing.shape();
    check_len("sparse_forward", gates.len(), samples)?;
    check_len("sparse_forward", input.len(), samples * hidden)?;
    for sample in 0..samples {
        let Some(row) = routing.row(sample) else {
            continue;
        };
        let gate = gates[sample];
        let src = &input[sample * hidden..(sample + 1) * hidden];
        for (dst, &x) in dispatched[row..row + hidden].iter_mut().zip(src) {
            *dst += gate * x;
        }
    }
    Ok(())
}

/// Gradient of [`encode_forward`] with respect to the input.
pub fn decode_backward_data<T: SparseElement>(
    routing: &Routing<'_>,
    gates: &[T],
    dispatched: &[T],
    input: &mut [T],
) -> Result<()> {
    let DispatchShape { samples, hidden, .. } = routing.shape();
    check_len("sparse_backward_data", gates.len(), samples)?;
    check_len("sparse_backward_data", input.len(), samples * hidden)?;
    for sample in 0..samples {
        let dst = &mut input[sample * hidden..(sample + 1) * hidden];
        match routing.row(sample) {
            Some(row) => {
                let gate = gates[sample];
                for (d, &v) in dst.iter_mut().zip(&dispatched[row..row + hidden]) {
                    *d = gate * v;
                }
            }
            None => dst.fill(T::default()),
        }
    }
    Ok(())
}

/// Gradient of [`encode_forward`] with respect to the gates.
pub fn gate_backward<T: SparseElement>(
    routing: &Routing<'_>,
    dispatched: &[T],
    input: &[T],
    gates: &mut [T],
) -> Result<()> {
    let DispatchShape { samples, hidden, .. } = routing.shape();
    check_len("sparse_backward_gate", gates.len(), samples)?;
    check_len("sparse_backward_gate", input.len(), samples * hidden)?;
    for (sample, gate) in gates.iter_mut().enumerate().take(samples) {
        *gate = T::default();
        let Some(row) = routing.row(sample) else {
            continue;
        };
        let src = &input[sample * hidden..(sample + 1) * hidden];
        for (&d, &x) in dispatched[row..row + hidden].iter().zip(src) {
            *gate += d * x;
        }
    }
    Ok(())
}

/// Host buffers of one sparse operator call.
///
/// `indices` and `locations` are `I64`; the other three share `F32` or `F64`.
#[derive(Debug, Clone, Copy)]
pub struct SparseBuffers<'a> {
    pub gates: &'a DeviceBuffer,
    pub indices: &'a DeviceBuffer,
    pub locations: &'a DeviceBuffer,
    pub input: &'a DeviceBuffer,
    pub dispatched: &'a DeviceBuffer,
}

/// Run `kernel` over host buffers, updating the buffer it writes in place
/// (`dispatched`, `input` or `gates` respectively).
pub fn invoke_host(kernel: SparseKernel, buffers: SparseBuffers<'_>, shape: DispatchShape) -> Result<()> {
    let op = kernel.name();
    for routing in [buffers.indices, buffers.locations] {
        if routing.dtype() != DType::I64 {
            return Err(OpsError::DtypeMismatch {
                op,
                expected: DType::I64,
                actual: routing.dtype(),
            });
        }
    }
    let dtype = buffers.gates.dtype();
    for values in [buffers.input, buffers.dispatched] {
        if values.dtype() != dtype {
            return Err(OpsError::DtypeMismatch {
                op,
                expected: dtype,
                actual: values.dtype(),
            });
        }
    }
    match dtype {
        DType::F32 => invoke_typed::<f32>(kernel, buffers, shape),
        DType::F64 => invoke_typed::<f64>(kernel, buffers, shape),
        other => Err(OpsError::UnsupportedDtype { op, dtype: other }),
    }
}

fn invoke_typed<T: SparseElement>(
    kernel: SparseKernel,
    buffers: SparseBuffers<'_>,
    shape: DispatchShape,
) -> Result<()> {
    let indices = buffers.indices.to_vec::<i64>()?;
    let locations = buffers.locations.to_vec::<i64>()?;
    let mut gates = buffers.gates.to_vec::<T>()?;
    let mut input = buffers.input.to_vec::<T>()?;
    let mut dispatched = buffers.dispatched.to_vec::<T>()?;
    let routing = Routing::new(kernel.name(), &indices, &locations, shape, dispatched.len())?;
    tracing::trace!(op = kernel.name(), ?shape, "sparse dispatch on host");
    match kernel {
        SparseKernel::Forward => {
            encode_forward(&routing, &gates, &input, &mut dispatched)?;
            buffers.dispatched.write_slice(&dispatched)?;
        }
        SparseKernel::BackwardData => {
            decode_backward_data(&routing, &gates, &dispatched, &mut input)?;
            buffers.input.write_slice(&input)?;
        }
        SparseKernel::BackwardGate => {
            gate_backward(&routing, &dispatched, &input, &mut gates)?;
            buffers.gates.write_slice(&gates)?;
        }
    }
    Ok(())
}
