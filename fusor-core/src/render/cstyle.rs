use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};

use crate::context::CompileContext;
use crate::device::Device;
use crate::dtype::{ConstVal, DType, Scalar};
use crate::error::{Error, Result};
use crate::uop::{AluOp, UOpArg, UOpKind, UOpRef};

use super::launch_dims;

/// Everything the emitter needs to speak one C-like dialect: qualifiers,
/// index expressions, synchronisation, and per-op spellings.
pub struct Dialect {
    pub name: &'static str,
    pub kernel_prefix: &'static str,
    pub buffer_prefix: &'static str,
    pub smem_prefix: &'static str,
    pub barrier: &'static str,
    pub gid: [&'static str; 3],
    pub lid: [&'static str; 3],
    pub extra_args: &'static [&'static str],
    pub has_image: bool,
    pub has_half_vload: bool,
    pub launch_bounds: bool,
    pub type_name: fn(Scalar) -> &'static str,
    pub vec_ctor: fn(&DType, &str) -> String,
}

fn c_type(s: Scalar) -> &'static str {
    match s {
        Scalar::Bool => "bool",
        Scalar::I32 => "int",
        Scalar::I64 => "long",
        Scalar::F16 => "half",
        Scalar::BF16 => "bfloat16",
        Scalar::F32 => "float",
        Scalar::F64 => "double",
    }
}

fn cuda_type(s: Scalar) -> &'static str {
    match s {
        Scalar::I64 => "long long",
        Scalar::BF16 => "__nv_bfloat16",
        other => c_type(other),
    }
}

pub static OPENCL: Dialect = Dialect {
    name: "CL",
    kernel_prefix: "__kernel ",
    buffer_prefix: "__global ",
    smem_prefix: "__local ",
    barrier: "barrier(CLK_LOCAL_MEM_FENCE);",
    gid: ["get_group_id(0)", "get_group_id(1)", "get_group_id(2)"],
    lid: ["get_local_id(0)", "get_local_id(1)", "get_local_id(2)"],
    extra_args: &[],
    has_image: true,
    has_half_vload: true,
    launch_bounds: false,
    type_name: c_type,
    vec_ctor: |dt, args| format!("({}{})({})", c_type(dt.base), dt.count, args),
};

pub static CUDA: Dialect = Dialect {
    name: "CUDA",
    kernel_prefix: "extern \"C\" __global__ ",
    buffer_prefix: "",
    smem_prefix: "__shared__ ",
    barrier: "__syncthreads();",
    gid: ["blockIdx.x", "blockIdx.y", "blockIdx.z"],
    lid: ["threadIdx.x", "threadIdx.y", "threadIdx.z"],
    extra_args: &[],
    has_image: false,
    has_half_vload: false,
    launch_bounds: true,
    type_name: cuda_type,
    vec_ctor: |dt, args| format!("make_{}{}({})", c_type(dt.base), dt.count, args),
};

pub static METAL: Dialect = Dialect {
    name: "METAL",
    kernel_prefix: "kernel ",
    buffer_prefix: "device ",
    smem_prefix: "threadgroup ",
    barrier: "threadgroup_barrier(mem_flags::mem_threadgroup);",
    gid: ["gid.x", "gid.y", "gid.z"],
    lid: ["lid.x", "lid.y", "lid.z"],
    extra_args: &[
        "uint3 gid [[threadgroup_position_in_grid]]",
        "uint3 lid [[thread_position_in_threadgroup]]",
    ],
    has_image: false,
    has_half_vload: false,
    launch_bounds: false,
    type_name: c_type,
    vec_ctor: |dt, args| format!("{}{}({})", c_type(dt.base), dt.count, args),
};

/// Plain C, for targets without a grid: every axis is a real loop.
pub static CSTYLE_CPU: Dialect = Dialect {
    name: "C",
    kernel_prefix: "",
    buffer_prefix: "",
    smem_prefix: "",
    barrier: "",
    gid: ["0", "0", "0"],
    lid: ["0", "0", "0"],
    extra_args: &[],
    has_image: false,
    has_half_vload: false,
    launch_bounds: false,
    type_name: c_type,
    vec_ctor: |dt, args| format!("({}{}){{{}}}", c_type(dt.base), dt.count, args),
};

pub fn dialect_for(device: Device) -> &'static Dialect {
    match device {
        Device::Cpu => &CSTYLE_CPU,
        Device::OpenCl => &OPENCL,
        Device::Cuda => &CUDA,
        Device::Metal => &METAL,
    }
}

impl Dialect {
    fn dtype_name(&self, dt: &DType) -> String {
        if dt.count > 1 {
            format!("{}{}", (self.type_name)(dt.base), dt.count)
        } else {
            (self.type_name)(dt.base).to_string()
        }
    }

    fn render_const(&self, v: ConstVal, dt: &DType) -> String {
        match v {
            ConstVal::Bool(bv) => (if bv { "1" } else { "0" }).to_string(),
            ConstVal::Int(i) => i.to_string(),
            ConstVal::Float(f) => {
                if f.is_nan() {
                    "NAN".to_string()
                } else if f.is_infinite() {
                    (if f < 0.0 { "-INFINITY" } else { "INFINITY" }).to_string()
                } else if dt.base == Scalar::F64 {
                    format!("{f:?}")
                } else {
                    format!("{f:?}f")
                }
            }
        }
    }

    fn code_for_op(&self, op: AluOp, args: &[String], dt: &DType) -> String {
        let float = dt.is_float();
        match op {
            AluOp::Neg => format!("(-{})", args[0]),
            AluOp::Recip => format!("(1.0f/{})", args[0]),
            AluOp::Sqrt => format!("sqrt({})", args[0]),
            AluOp::Exp2 => format!("exp2({})", args[0]),
            AluOp::Log2 => format!("log2({})", args[0]),
            AluOp::Sin => format!("sin({})", args[0]),
            AluOp::Add => format!("({}+{})", args[0], args[1]),
            AluOp::Sub => format!("({}-{})", args[0], args[1]),
            AluOp::Mul => format!("({}*{})", args[0], args[1]),
            AluOp::Div => format!("({}/{})", args[0], args[1]),
            AluOp::Mod => format!("({}%{})", args[0], args[1]),
            AluOp::Max => {
                if float {
                    format!("fmax({},{})", args[0], args[1])
                } else {
                    format!("max({},{})", args[0], args[1])
                }
            }
            AluOp::Min => {
                if float {
                    format!("fmin({},{})", args[0], args[1])
                } else {
                    format!("min({},{})", args[0], args[1])
                }
            }
            AluOp::CmpLt => format!("({}<{})", args[0], args[1]),
            AluOp::CmpNe => format!("({}!={})", args[0], args[1]),
            AluOp::Where => format!("({}?{}:{})", args[0], args[1], args[2]),
            AluOp::MulAcc => format!("(({}*{})+{})", args[0], args[1], args[2]),
        }
    }
}

struct Emitter<'a> {
    dialect: &'a Dialect,
    lines: Vec<String>,
    depth: usize,
    r: HashMap<u64, String>,
    ssa: HashMap<&'static str, usize>,
    bufs: Vec<(usize, String, DType, bool)>,
}

impl<'a> Emitter<'a> {
    fn kk(&mut self, s: String) {
        self.lines.push(format!("{}{}", "  ".repeat(self.depth), s));
    }

    fn ssa(&mut self, prefix: &'static str) -> String {
        let n = self.ssa.entry(prefix).or_insert(0);
        let name = format!("{prefix}{n}");
        *n += 1;
        name
    }

    fn decl(&mut self, u: &UOpRef, prefix: &'static str, expr: String) {
        let name = self.ssa(prefix);
        let ty = self.dialect.dtype_name(&u.dtype.unwrap());
        self.kk(format!("{ty} {name} = {expr};"));
        self.r.insert(u.id, name);
    }
}

/// Emit source for an ordered program. Deterministic: the same program and
/// dialect produce byte-identical source.
pub fn render(
    name: &str,
    uops: &[UOpRef],
    dialect: &Dialect,
) -> Result<(String, Vec<i64>, Vec<i64>)> {
    let (global_size, local_size) = launch_dims(uops);
    let n_gidx = uops
        .iter()
        .filter(
            |u| matches!(&u.arg, UOpArg::Special { name, .. } if name.starts_with("gidx")),
        )
        .count();
    let n_lidx = uops
        .iter()
        .filter(
            |u| matches!(&u.arg, UOpArg::Special { name, .. } if name.starts_with("lidx")),
        )
        .count();

    let mut e = Emitter {
        dialect,
        lines: vec![],
        depth: 1,
        r: HashMap::new(),
        ssa: HashMap::new(),
        bufs: vec![],
    };

    for u in uops {
        match u.op {
            UOpKind::Sink => {}
            UOpKind::DefineGlobal => {
                let UOpArg::Buffer { index, writable } = &u.arg else {
                    return ir_err("DEFINE_GLOBAL without buffer arg", uops);
                };
                let (index, writable) = (*index, *writable);
                let bname = format!("data{index}");
                e.r.insert(u.id, bname.clone());
                e.bufs.push((index, bname, u.dtype.unwrap(), writable));
            }
            UOpKind::DefineLocal => {
                let UOpArg::Local { name, size } = &u.arg else {
                    return ir_err("DEFINE_LOCAL without arg", uops);
                };
                let ty = dialect.dtype_name(&u.dtype.unwrap());
                e.kk(format!("{}{ty} {name}[{size}];", dialect.smem_prefix));
                e.r.insert(u.id, name.clone());
            }
            UOpKind::Special => {
                let UOpArg::Special { name, size } = &u.arg else {
                    return ir_err("SPECIAL without arg", uops);
                };
                let (table, count, k) = if let Some(k) = name.strip_prefix("gidx") {
                    (&dialect.gid, n_gidx, k.parse::<usize>().unwrap_or(0))
                } else {
                    (&dialect.lid, n_lidx, name[4..].parse::<usize>().unwrap_or(0))
                };
                let dim = count - 1 - k;
                e.kk(format!(
                    "int {name} = {}; /* {size} */",
                    table[dim.min(2)]
                ));
                e.r.insert(u.id, name.clone());
            }
            UOpKind::Const => {
                let UOpArg::Const(c) = &u.arg else {
                    return ir_err("CONST without value", uops);
                };
                let s = dialect.render_const(*c, &u.dtype.unwrap());
                // negative literals parenthesised so they substitute safely
                let s = if s.starts_with('-') { format!("({s})") } else { s };
                e.r.insert(u.id, s);
            }
            UOpKind::Range => {
                let UOpArg::Range { id, is_reduce } = &u.arg else {
                    return ir_err("RANGE without arg", uops);
                };
                let (id, is_reduce) = (*id, *is_reduce);
                let var = if is_reduce {
                    format!("ridx{id}")
                } else {
                    format!("idx{id}")
                };
                let lo = e.r[&u.src[0].id].clone();
                let hi = e.r[&u.src[1].id].clone();
                e.kk(format!("for (int {var} = {lo}; {var} < {hi}; {var}++) {{"));
                e.depth += 1;
                e.r.insert(u.id, var);
            }
            UOpKind::EndRange => {
                e.depth -= 1;
                e.kk("}".to_string());
            }
            UOpKind::If => {
                let gate = e.r[&u.src[0].id].clone();
                e.kk(format!("if ({gate}) {{"));
                e.depth += 1;
            }
            UOpKind::EndIf => {
                e.depth -= 1;
                e.kk("}".to_string());
            }
            UOpKind::Barrier => e.kk(dialect.barrier.to_string()),
            UOpKind::DefineAcc => {
                let init = e.r[&u.src[0].id].clone();
                e.decl(u, "acc", init);
            }
            UOpKind::Phi => {
                let acc = e.r[&u.src[0].id].clone();
                let val = e.r[&u.src[1].id].clone();
                e.kk(format!("{acc} = {val};"));
                e.r.insert(u.id, acc);
            }
            UOpKind::Alu => {
                let args: Vec<String> =
                    u.src.iter().map(|s| e.r[&s.id].clone()).collect();
                let code = dialect.code_for_op(
                    u.alu_op().unwrap(),
                    &args,
                    &u.src[0].dtype.unwrap_or(DType::F32),
                );
                e.decl(u, "alu", code);
            }
            UOpKind::Cast => {
                let ty = dialect.dtype_name(&u.dtype.unwrap());
                let src = e.r[&u.src[0].id].clone();
                e.decl(u, "cast", format!("({ty})({src})"));
            }
            UOpKind::Bitcast => {
                let ty = dialect.dtype_name(&u.dtype.unwrap());
                let src = e.r[&u.src[0].id].clone();
                e.decl(u, "cast", format!("(*(({ty}*)&{src}))"));
            }
            UOpKind::Vectorize => {
                let dt = u.dtype.unwrap();
                let args: Vec<String> =
                    u.src.iter().map(|s| e.r[&s.id].clone()).collect();
                let ctor = (dialect.vec_ctor)(&dt, &args.join(","));
                e.decl(u, "cast", ctor);
            }
            UOpKind::Gep => {
                let UOpArg::Gep(i) = &u.arg else {
                    return ir_err("GEP without index", uops);
                };
                let src = &e.r[&u.src[0].id];
                let access = if u.src[0].dtype.map(|d| d.count).unwrap_or(1) <= 4 {
                    format!("{src}.{}", ["x", "y", "z", "w"][*i])
                } else {
                    format!("{src}.s{i}")
                };
                e.r.insert(u.id, access);
            }
            UOpKind::Load => render_load(&mut e, u)?,
            UOpKind::Store => render_store(&mut e, u)?,
            UOpKind::Wmma => render_wmma(&mut e, u, uops)?,
            UOpKind::Noop => {}
            _ => return ir_err(&format!("cannot render {:?}", u.op), uops),
        }
    }

    // kernel signature
    e.bufs.sort_by_key(|(i, ..)| *i);
    let mut params: Vec<String> = e
        .bufs
        .iter()
        .map(|(_, bname, dt, writable)| {
            if dt.is_image() {
                let access = if *writable { "write_only" } else { "read_only" };
                format!("{access} image2d_t {bname}")
            } else {
                let konst = if *writable { "" } else { "const " };
                format!(
                    "{konst}{}{}* {bname}",
                    dialect.buffer_prefix,
                    dialect.dtype_name(&dt.scalar())
                )
            }
        })
        .collect();
    params.extend(dialect.extra_args.iter().map(|s| s.to_string()));

    let bounds = if dialect.launch_bounds && !local_size.is_empty() {
        format!(
            "__launch_bounds__({}) ",
            local_size.iter().product::<i64>()
        )
    } else {
        String::new()
    };
    let mut src = String::new();
    if dialect.has_half_vload
        && e.bufs.iter().any(|(_, _, dt, _)| dt.base == Scalar::F16)
    {
        src.push_str("#pragma OPENCL EXTENSION cl_khr_fp16 : enable\n");
    }
    src.push_str(&format!(
        "{}void {bounds}{name}({}) {{\n",
        dialect.kernel_prefix,
        params.join(", ")
    ));
    if e.bufs.iter().any(|(_, _, dt, _)| dt.is_image()) {
        src.push_str(
            "  const sampler_t smp = CLK_NORMALIZED_COORDS_FALSE | CLK_ADDRESS_CLAMP | CLK_FILTER_NEAREST;\n",
        );
    }
    for line in &e.lines {
        src.push_str(line);
        src.push('\n');
    }
    src.push_str("}\n");
    Ok((src, global_size, local_size))
}

fn ir_err<T>(msg: &str, uops: &[UOpRef]) -> Result<T> {
    Err(Error::IrViolation {
        msg: msg.to_string(),
        uops: super::print_uops(uops),
    })
}

fn render_load(e: &mut Emitter, u: &UOpRef) -> Result<()> {
    let dialect = e.dialect;
    let dt = u.dtype.unwrap();
    let buf = &u.src[0];
    let buf_name = e.r[&buf.id].clone();
    let idx = e.r[&u.src[1].id].clone();
    let val = if buf.dtype.is_some_and(|d| d.is_image()) {
        format!("read_imagef({buf_name}, smp, {idx})")
    } else if dialect.has_half_vload && dt.base == Scalar::F16 && dt.count > 1 {
        format!("vload_half{}(0, {buf_name}+{idx})", dt.count)
    } else if dt.count > 1 {
        let local = buf.op == UOpKind::DefineLocal;
        let prefix = if local {
            dialect.smem_prefix
        } else {
            dialect.buffer_prefix
        };
        format!(
            "(*(({prefix}{}*)({buf_name}+{idx})))",
            dialect.dtype_name(&dt)
        )
    } else {
        format!("{buf_name}[{idx}]")
    };
    // a gated load reads the alternative when out of range
    let val = if u.src.len() >= 4 && u.src[3].dtype == Some(DType::BOOL) {
        let gate = &e.r[&u.src[3].id];
        let alt = &e.r[&u.src[2].id];
        format!("({gate}?{val}:{alt})")
    } else {
        val
    };
    e.decl(u, "val", val);
    Ok(())
}

fn render_store(e: &mut Emitter, u: &UOpRef) -> Result<()> {
    let dialect = e.dialect;
    let buf = &u.src[0];
    let buf_name = e.r[&buf.id].clone();
    let idx = e.r[&u.src[1].id].clone();
    let val = e.r[&u.src[2].id].clone();
    let vdt = u.src[2].dtype.unwrap_or(DType::F32);
    let stmt = if buf.dtype.is_some_and(|d| d.is_image()) {
        format!("write_imagef({buf_name}, {idx}, {val});")
    } else if dialect.has_half_vload && vdt.base == Scalar::F16 && vdt.count > 1 {
        format!("vstore_half{}({val}, 0, {buf_name}+{idx});", vdt.count)
    } else if vdt.count > 1 {
        let local = buf.op == UOpKind::DefineLocal;
        let prefix = if local {
            dialect.smem_prefix
        } else {
            dialect.buffer_prefix
        };
        format!(
            "*(({prefix}{}*)({buf_name}+{idx})) = {val};",
            dialect.dtype_name(&vdt)
        )
    } else {
        format!("{buf_name}[{idx}] = {val};")
    };
    if u.src.len() >= 4 {
        let gate = e.r[&u.src[3].id].clone();
        e.kk(format!("if ({gate}) {{ {stmt} }}"));
    } else {
        e.kk(stmt);
    }
    Ok(())
}

fn render_wmma(e: &mut Emitter, u: &UOpRef, uops: &[UOpRef]) -> Result<()> {
    let UOpArg::Wmma(arg) = &u.arg else {
        return ir_err("WMMA without arg", uops);
    };
    match e.dialect.name {
        "METAL" => {
            let (a, bb, c) = (
                e.r[&u.src[0].id].clone(),
                e.r[&u.src[1].id].clone(),
                e.r[&u.src[2].id].clone(),
            );
            let out = e.ssa("wmma");
            let ty = e.dialect.dtype_name(&u.dtype.unwrap());
            e.kk(format!("{ty} {out};"));
            e.kk("{".to_string());
            e.depth += 1;
            e.kk("simdgroup_float8x8 wa, wb, wc;".to_string());
            e.kk(format!(
                "wa.thread_elements()[0] = {a}.x; wa.thread_elements()[1] = {a}.y;"
            ));
            e.kk(format!(
                "wb.thread_elements()[0] = {bb}.x; wb.thread_elements()[1] = {bb}.y;"
            ));
            e.kk(format!(
                "wc.thread_elements()[0] = {c}.x; wc.thread_elements()[1] = {c}.y;"
            ));
            e.kk("simdgroup_multiply_accumulate(wc, wa, wb, wc);".to_string());
            e.kk(format!(
                "{out} = {};",
                (e.dialect.vec_ctor)(
                    &u.dtype.unwrap(),
                    "wc.thread_elements()[0],wc.thread_elements()[1]"
                )
            ));
            e.depth -= 1;
            e.kk("}".to_string());
            e.r.insert(u.id, out);
            Ok(())
        }
        _ => ir_err(
            &format!("{} has no lowering for {}", e.dialect.name, arg.name),
            uops,
        ),
    }
}

/// Derive the final kernel name: the base (op class + shape) plus a
/// disambiguating suffix when a previous kernel claimed it with different
/// source.
pub fn finalize_name(
    ctx: &CompileContext,
    base: &str,
    source_with_base: &str,
) -> (String, String) {
    let mut hasher = DefaultHasher::new();
    source_with_base.hash(&mut hasher);
    let name = ctx.kernel_name(base, hasher.finish());
    if name == base {
        (name, source_with_base.to_string())
    } else {
        let source = source_with_base.replace(base, &name);
        (name, source)
    }
}
