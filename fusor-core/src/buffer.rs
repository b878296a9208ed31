use std::cell::RefCell;
use std::rc::Rc;

use half::{bf16, f16};
use rayon::prelude::*;

use crate::dtype::{ConstVal, DType, Scalar};

pub type BufferHandle = Rc<RefCell<Buffer>>;

#[derive(Clone, Debug)]
pub enum BufferData {
    Bool(Vec<bool>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

/// Realised storage for one tensor. Dtype-erased so drivers and the
/// interpreter can bind it without generics.
#[derive(Clone, Debug)]
pub struct Buffer {
    pub dtype: DType,
    pub data: BufferData,
}

impl Buffer {
    pub fn zeroed(dtype: DType, len: usize) -> Buffer {
        let data = match dtype.base {
            Scalar::Bool => BufferData::Bool(vec![false; len]),
            Scalar::I32 => BufferData::I32(vec![0; len]),
            Scalar::I64 => BufferData::I64(vec![0; len]),
            Scalar::F16 => BufferData::F16(vec![f16::ZERO; len]),
            Scalar::BF16 => BufferData::BF16(vec![bf16::ZERO; len]),
            Scalar::F32 => BufferData::F32(vec![0.0; len]),
            Scalar::F64 => BufferData::F64(vec![0.0; len]),
        };
        Buffer { dtype, data }
    }

    pub fn from_f64s(dtype: DType, vals: &[f64]) -> Buffer {
        let mut buf = Buffer::zeroed(dtype, vals.len());
        for (i, v) in vals.iter().enumerate() {
            buf.set(i, ConstVal::of(dtype, *v));
        }
        buf
    }

    pub fn len(&self) -> usize {
        match &self.data {
            BufferData::Bool(v) => v.len(),
            BufferData::I32(v) => v.len(),
            BufferData::I64(v) => v.len(),
            BufferData::F16(v) => v.len(),
            BufferData::BF16(v) => v.len(),
            BufferData::F32(v) => v.len(),
            BufferData::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, i: usize) -> ConstVal {
        match &self.data {
            BufferData::Bool(v) => ConstVal::Bool(v[i]),
            BufferData::I32(v) => ConstVal::Int(v[i] as i64),
            BufferData::I64(v) => ConstVal::Int(v[i]),
            BufferData::F16(v) => ConstVal::Float(f64::from(v[i])),
            BufferData::BF16(v) => ConstVal::Float(f64::from(v[i])),
            BufferData::F32(v) => ConstVal::Float(v[i] as f64),
            BufferData::F64(v) => ConstVal::Float(v[i]),
        }
    }

    pub fn set(&mut self, i: usize, val: ConstVal) {
        match &mut self.data {
            BufferData::Bool(v) => v[i] = val.as_bool(),
            BufferData::I32(v) => v[i] = val.as_i64() as i32,
            BufferData::I64(v) => v[i] = val.as_i64(),
            BufferData::F16(v) => v[i] = f16::from_f64(val.as_f64()),
            BufferData::BF16(v) => v[i] = bf16::from_f64(val.as_f64()),
            BufferData::F32(v) => v[i] = val.as_f64() as f32,
            BufferData::F64(v) => v[i] = val.as_f64(),
        }
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        (0..self.len()).map(|i| self.get(i).as_f64()).collect()
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        (0..self.len()).map(|i| self.get(i).as_f64() as f32).collect()
    }

    pub fn to_i64_vec(&self) -> Vec<i64> {
        (0..self.len()).map(|i| self.get(i).as_i64()).collect()
    }

    /// Elementwise cast to another scalar dtype.
    pub fn cast(&self, dtype: DType) -> Buffer {
        if dtype == self.dtype {
            return self.clone();
        }
        let raw: Vec<f64> = self.to_f64_vec();
        let data = match dtype.base {
            Scalar::Bool => BufferData::Bool(raw.par_iter().map(|v| *v != 0.0).collect()),
            Scalar::I32 => BufferData::I32(raw.par_iter().map(|v| *v as i32).collect()),
            Scalar::I64 => BufferData::I64(raw.par_iter().map(|v| *v as i64).collect()),
            Scalar::F16 => BufferData::F16(raw.par_iter().map(|v| f16::from_f64(*v)).collect()),
            Scalar::BF16 => {
                BufferData::BF16(raw.par_iter().map(|v| bf16::from_f64(*v)).collect())
            }
            Scalar::F32 => BufferData::F32(raw.par_iter().map(|v| *v as f32).collect()),
            Scalar::F64 => BufferData::F64(raw),
        };
        Buffer { dtype, data }
    }
}
