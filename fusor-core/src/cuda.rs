use std::fs;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cudarc::driver::{CudaFunction, CudaModule, LaunchConfig, PushKernelArg};
use cudarc::nvrtc::{CompileOptions, Ptx};

use crate::buffer::{BufferData, BufferHandle};
use crate::device::{CompiledKernel, Driver, Program};
use crate::dtype::Scalar;
use crate::error::{Error, Result, WrapErr};

/// NVRTC-backed driver: compiles rendered CUDA source to PTX and launches
/// it. Register it on [`crate::DeviceRegistry`] for [`crate::Device::Cuda`].
pub struct CudaDriver {
    context: Arc<cudarc::driver::CudaContext>,
    stream: Arc<cudarc::driver::CudaStream>,
    modules: std::sync::RwLock<Vec<Arc<CudaModule>>>,
}

impl CudaDriver {
    pub fn new(ordinal: usize) -> Result<Self> {
        let context = cudarc::driver::CudaContext::new(ordinal).w()?;
        let stream = context.new_stream().w()?;
        Ok(Self {
            context,
            stream,
            modules: std::sync::RwLock::new(vec![]),
        })
    }

    fn load_func(&self, function_name: &str, ptx: Ptx) -> Result<CudaFunction> {
        let module = self.context.load_module(ptx).w()?;
        let func = module.load_function(function_name).w()?;
        self.modules.write().unwrap().push(module);
        Ok(func)
    }
}

fn cuda_include_dir() -> Option<PathBuf> {
    let env_vars = [
        "CUDA_PATH",
        "CUDA_ROOT",
        "CUDA_TOOLKIT_ROOT_DIR",
        "CUDNN_LIB",
    ];
    let env_vars = env_vars
        .into_iter()
        .map(std::env::var)
        .filter_map(std::result::Result::ok)
        .map(Into::<PathBuf>::into);

    let roots = [
        "/usr",
        "/usr/local/cuda",
        "/opt/cuda",
        "/usr/lib/cuda",
        "C:/Program Files/NVIDIA GPU Computing Toolkit",
        "C:/CUDA",
    ];
    let roots = roots.into_iter().map(Into::<PathBuf>::into);

    env_vars
        .chain(roots)
        .find(|path| path.join("include").join("cuda.h").is_file())
}

fn compile_source(source: &str) -> Result<Ptx> {
    let include_paths = cuda_include_dir()
        .map(|p| vec![p.join("include").display().to_string()])
        .unwrap_or_default();
    cudarc::nvrtc::compile_ptx_with_opts(
        source,
        CompileOptions {
            use_fast_math: Some(true),
            include_paths,
            ..Default::default()
        },
    )
    .w()
}

fn cached_ptx(name: &str, source: &str) -> Result<Ptx> {
    let Some(home) = dirs::home_dir() else {
        return compile_source(source);
    };
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    let path = home.join(format!(".cache/fusor/ptx/{name}_{}.ptx", hasher.finish()));
    if Path::new(&path).exists() {
        if let Ok(ptx) = fs::read_to_string(&path) {
            return Ok(Ptx::from_src(ptx));
        }
    }
    let ptx = compile_source(source)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, ptx.to_src())?;
    Ok(ptx)
}

pub struct CudaKernel {
    func: CudaFunction,
    stream: Arc<cudarc::driver::CudaStream>,
    global_size: Vec<i64>,
    local_size: Vec<i64>,
}

impl Driver for CudaDriver {
    fn compile(&self, prog: &Program) -> Result<Box<dyn CompiledKernel>> {
        let ptx = cached_ptx(&prog.name, &prog.source)?;
        let func = self.load_func(&prog.name, ptx)?;
        Ok(Box::new(CudaKernel {
            func,
            stream: self.stream.clone(),
            global_size: prog.global_size.clone(),
            local_size: prog.local_size.clone(),
        }))
    }
}

fn dim3(v: &[i64]) -> (u32, u32, u32) {
    (
        v.first().copied().unwrap_or(1) as u32,
        v.get(1).copied().unwrap_or(1) as u32,
        v.get(2).copied().unwrap_or(1) as u32,
    )
}

impl CompiledKernel for CudaKernel {
    fn launch(&self, bufs: &[BufferHandle]) -> Result<()> {
        // device copies in, launch, copy back out
        let mut slices = Vec::with_capacity(bufs.len());
        for buf in bufs {
            let b = buf.borrow();
            let BufferData::F32(host) = &b.data else {
                return Err(Error::UnsupportedOp {
                    target: "CUDA",
                    op: format!("launch with non-{} buffer", Scalar::F32.name()),
                });
            };
            slices.push(self.stream.memcpy_stod(host).w()?);
        }
        let cfg = LaunchConfig {
            grid_dim: dim3(&self.global_size),
            block_dim: if self.local_size.is_empty() {
                (1, 1, 1)
            } else {
                dim3(&self.local_size)
            },
            shared_mem_bytes: 0,
        };
        let mut builder = self.stream.launch_builder(&self.func);
        for slice in &slices {
            builder.arg(slice);
        }
        unsafe { builder.launch(cfg).w()? };
        for (buf, slice) in bufs.iter().zip(&slices) {
            let host = self.stream.memcpy_dtov(slice).w()?;
            let mut b = buf.borrow_mut();
            b.data = BufferData::F32(host);
        }
        Ok(())
    }
}
