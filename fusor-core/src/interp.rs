use std::collections::HashMap;

use crate::buffer::BufferHandle;
use crate::device::{CompiledKernel, Driver, Program};
use crate::dtype::{ConstVal, DType};
use crate::error::{Error, Result};
use crate::uop::{exec_alu, UOpArg, UOpKind, UOpRef};

/// Driver for the CPU target: "compilation" keeps the ordered program and
/// launching walks it. CPU programs are lowered with `has_local = false`,
/// so everything is sequential RANGE loops.
pub struct CpuDriver;

impl Driver for CpuDriver {
    fn compile(&self, prog: &Program) -> Result<Box<dyn CompiledKernel>> {
        Ok(Box::new(InterpKernel {
            uops: prog.uops.clone(),
        }))
    }
}

struct InterpKernel {
    uops: Vec<UOpRef>,
}

impl CompiledKernel for InterpKernel {
    fn launch(&self, bufs: &[BufferHandle]) -> Result<()> {
        interpret(&self.uops, bufs)
    }
}

fn cast_val(v: ConstVal, dt: DType) -> ConstVal {
    match v {
        ConstVal::Int(i) if dt.is_int() => ConstVal::of_int(dt, i),
        other => ConstVal::of(dt, other.as_f64()),
    }
}

fn interpret(uops: &[UOpRef], bufs: &[BufferHandle]) -> Result<()> {
    let mut values: HashMap<u64, ConstVal> = HashMap::new();
    let mut range_pc: HashMap<u64, usize> = HashMap::new();
    let unsupported = |u: &UOpRef| -> Error {
        Error::UnsupportedOp {
            target: "CPU",
            op: format!("{:?}", u.op),
        }
    };
    let buffer_of = |u: &UOpRef| -> Result<&BufferHandle> {
        match &u.arg {
            UOpArg::Buffer { index, .. } => bufs.get(*index).ok_or_else(|| Error::IrViolation {
                msg: format!("kernel launched without buffer {index}"),
                uops: String::new(),
            }),
            _ => Err(Error::IrViolation {
                msg: "memory op on a non-global buffer".into(),
                uops: String::new(),
            }),
        }
    };

    let mut pc = 0usize;
    while pc < uops.len() {
        let u = &uops[pc];
        match u.op {
            UOpKind::Sink
            | UOpKind::Noop
            | UOpKind::DefineGlobal
            | UOpKind::Barrier
            | UOpKind::EndIf => {}
            UOpKind::Const => {
                let UOpArg::Const(c) = &u.arg else {
                    return Err(unsupported(u));
                };
                values.insert(u.id, *c);
            }
            UOpKind::Range => {
                range_pc.insert(u.id, pc);
                values.insert(u.id, values[&u.src[0].id]);
            }
            UOpKind::EndRange => {
                let rng = &u.src[0];
                let next = values[&rng.id].as_i64() + 1;
                if next < values[&rng.src[1].id].as_i64() {
                    values.insert(rng.id, ConstVal::Int(next));
                    pc = range_pc[&rng.id] + 1;
                    continue;
                }
            }
            UOpKind::DefineAcc => {
                values.insert(u.id, values[&u.src[0].id]);
            }
            UOpKind::Phi => {
                let v = values[&u.src[1].id];
                values.insert(u.src[0].id, v);
                values.insert(u.id, v);
            }
            UOpKind::Alu => {
                let vals: Vec<ConstVal> =
                    u.src.iter().map(|s| values[&s.id]).collect();
                let dt = u.dtype.ok_or_else(|| unsupported(u))?;
                values.insert(u.id, exec_alu(u.alu_op().unwrap(), dt, &vals));
            }
            UOpKind::Cast => {
                let dt = u.dtype.ok_or_else(|| unsupported(u))?;
                values.insert(u.id, cast_val(values[&u.src[0].id], dt));
            }
            UOpKind::Load => {
                let gated = u.src.len() >= 4;
                let v = if gated && !values[&u.src[3].id].as_bool() {
                    values[&u.src[2].id]
                } else {
                    let buf = buffer_of(&u.src[0])?;
                    let idx = values[&u.src[1].id].as_i64();
                    let b = buf.borrow();
                    if idx < 0 || idx as usize >= b.len() {
                        return Err(Error::IrViolation {
                            msg: format!("load out of bounds at {idx}"),
                            uops: String::new(),
                        });
                    }
                    b.get(idx as usize)
                };
                values.insert(u.id, v);
            }
            UOpKind::Store => {
                let gated = u.src.len() >= 4;
                if !gated || values[&u.src[3].id].as_bool() {
                    let buf = buffer_of(&u.src[0])?;
                    let idx = values[&u.src[1].id].as_i64();
                    let val = values[&u.src[2].id];
                    let mut b = buf.borrow_mut();
                    if idx < 0 || idx as usize >= b.len() {
                        return Err(Error::IrViolation {
                            msg: format!("store out of bounds at {idx}"),
                            uops: String::new(),
                        });
                    }
                    b.set(idx as usize, val);
                }
            }
            _ => return Err(unsupported(u)),
        }
        pc += 1;
    }
    Ok(())
}
