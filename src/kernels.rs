//! Host implementations of the external kernels
//!
//! On the device these are opaque object-file routines. The simulator needs
//! something to call, so each declared symbol can be bound to a Rust
//! implementation operating on raw slot bytes.

use std::collections::HashMap;
use std::sync::Arc;

use crate::compute::{KernelVariant, PASS_THROUGH_SYMBOL};
use crate::error::{CompileError, CompileResult};

/// A kernel callable by the simulator.
///
/// `inputs` are the consumed slots in argument order, `output` is the slot
/// held on the produce side, `scalars` are the integer arguments.
pub trait Kernel: Send + Sync {
    fn invoke(&self, inputs: &[&[u8]], output: &mut [u8], scalars: &[i32]) -> CompileResult<()>;
}

impl<F> Kernel for F
where
    F: Fn(&[&[u8]], &mut [u8], &[i32]) -> CompileResult<()> + Send + Sync,
{
    fn invoke(&self, inputs: &[&[u8]], output: &mut [u8], scalars: &[i32]) -> CompileResult<()> {
        self(inputs, output, scalars)
    }
}

/// Kernels by symbol
#[derive(Clone, Default)]
pub struct KernelRegistry {
    kernels: HashMap<String, Arc<dyn Kernel>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in kernel symbol bound.
    pub fn reference() -> Self {
        let mut registry = Self::new();
        for variant in [KernelVariant::Scalar, KernelVariant::Vectorized] {
            let tag = variant.tag();
            registry.register(format!("zero_{}_f32", tag), zero_f32);
            registry.register(format!("matvec_{}_bf16_f32", tag), matvec_bf16_f32);
        }
        registry.register(PASS_THROUGH_SYMBOL, pass_through);
        registry
    }

    pub fn register(&mut self, symbol: impl Into<String>, kernel: impl Kernel + 'static) {
        self.kernels.insert(symbol.into(), Arc::new(kernel));
    }

    pub fn get(&self, symbol: &str) -> CompileResult<&dyn Kernel> {
        self.kernels
            .get(symbol)
            .map(|k| k.as_ref())
            .ok_or_else(|| CompileError::runtime(format!("no kernel bound to '{}'", symbol)))
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.kernels.contains_key(symbol)
    }
}

pub fn bf16_to_f32(bits: u16) -> f32 {
    f32::from_bits((bits as u32) << 16)
}

/// Truncating conversion; exact for values representable in bf16.
pub fn f32_to_bf16(value: f32) -> u16 {
    (value.to_bits() >> 16) as u16
}

fn zero_f32(_inputs: &[&[u8]], output: &mut [u8], _scalars: &[i32]) -> CompileResult<()> {
    output.fill(0);
    Ok(())
}

/// `out[r] += sum_c A[r][c] * b[c]`, with `A` delivered column-pair by
/// column-pair: element `A[r][2p + l]` sits at index `(p * m + r) * 2 + l`.
fn matvec_bf16_f32(inputs: &[&[u8]], output: &mut [u8], _scalars: &[i32]) -> CompileResult<()> {
    let &[a, b] = inputs else {
        return Err(CompileError::runtime(format!(
            "matvec expects 2 inputs, got {}",
            inputs.len()
        )));
    };
    let m = output.len() / 4;
    let k = b.len() / 2;
    if a.len() != m * k * 2 || k % 2 != 0 {
        return Err(CompileError::runtime(format!(
            "matvec block of {} bytes does not match m = {}, k = {}",
            a.len(),
            m,
            k
        )));
    }
    let load = |bytes: &[u8], i: usize| {
        bf16_to_f32(u16::from_le_bytes([bytes[2 * i], bytes[2 * i + 1]]))
    };

    for r in 0..m {
        let mut acc = f32::from_le_bytes([
            output[4 * r],
            output[4 * r + 1],
            output[4 * r + 2],
            output[4 * r + 3],
        ]);
        for c in 0..k {
            let (p, l) = (c / 2, c % 2);
            acc += load(a, (p * m + r) * 2 + l) * load(b, c);
        }
        output[4 * r..4 * r + 4].copy_from_slice(&acc.to_le_bytes());
    }
    Ok(())
}

/// Copy one line of `scalars[0]` elements; the element width follows from
/// the slot size.
fn pass_through(inputs: &[&[u8]], output: &mut [u8], scalars: &[i32]) -> CompileResult<()> {
    let input = inputs
        .first()
        .ok_or_else(|| CompileError::runtime("pass-through expects one input"))?;
    let len = scalars
        .first()
        .and_then(|&n| usize::try_from(n).ok())
        .filter(|&n| n > 0)
        .ok_or_else(|| CompileError::runtime("pass-through expects a line length"))?;
    if input.len() % len != 0 || output.len() != input.len() {
        return Err(CompileError::runtime(format!(
            "line of {} elements does not fit slots of {} and {} bytes",
            len,
            input.len(),
            output.len()
        )));
    }
    output.copy_from_slice(input);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bf16_bytes(values: &[f32]) -> Vec<u8> {
        values
            .iter()
            .flat_map(|&v| f32_to_bf16(v).to_le_bytes())
            .collect()
    }

    #[test]
    fn test_bf16_round_trip_small_integers() {
        for v in [-3.0f32, 0.0, 1.0, 7.0, 100.0] {
            assert_eq!(bf16_to_f32(f32_to_bf16(v)), v);
        }
    }

    #[test]
    fn test_matvec_reads_pair_transposed_block() {
        // A = [[1, 2], [3, 4]] (m = 2, k = 2): pairs are whole rows, so the
        // transposed layout is [A00, A01, A10, A11] = [1, 2, 3, 4]
        let a = bf16_bytes(&[1.0, 2.0, 3.0, 4.0]);
        let b = bf16_bytes(&[1.0, 10.0]);
        let mut out = vec![0u8; 8];
        let registry = KernelRegistry::reference();
        let kernel = registry.get("matvec_vectorized_bf16_f32").unwrap();
        kernel.invoke(&[&a, &b], &mut out, &[]).unwrap();
        kernel.invoke(&[&a, &b], &mut out, &[]).unwrap();
        let r0 = f32::from_le_bytes([out[0], out[1], out[2], out[3]]);
        let r1 = f32::from_le_bytes([out[4], out[5], out[6], out[7]]);
        assert_eq!((r0, r1), (42.0, 86.0));
    }

    #[test]
    fn test_pass_through_and_zero() {
        let registry = KernelRegistry::reference();
        let mut out = vec![9u8; 4];
        registry
            .get("zero_scalar_f32")
            .unwrap()
            .invoke(&[], &mut out, &[])
            .unwrap();
        assert_eq!(out, vec![0; 4]);
        registry
            .get(PASS_THROUGH_SYMBOL)
            .unwrap()
            .invoke(&[&[1, 2, 3, 4]], &mut out, &[4])
            .unwrap();
        assert_eq!(out, vec![1, 2, 3, 4]);
        assert!(registry.get("missing").is_err());
    }
}
