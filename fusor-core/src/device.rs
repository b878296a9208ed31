use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::buffer::BufferHandle;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::uop::UOpRef;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Device {
    Cpu,
    OpenCl,
    Cuda,
    Metal,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Device::Cpu => "CPU",
            Device::OpenCl => "CL",
            Device::Cuda => "CUDA",
            Device::Metal => "METAL",
        })
    }
}

/// One tensor-core shape a target can issue, with its operand contract.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TensorCore {
    pub dims: (i64, i64, i64),
    pub dtype_in: DType,
    pub dtype_out: DType,
}

/// What the linearizer needs to know about a target. Dialect text lives
/// separately in the renderer; this is purely about lowering decisions.
#[derive(Clone, Debug)]
pub struct TargetSpec {
    pub device: Device,
    pub has_local: bool,
    pub supports_float4: bool,
    pub has_image: bool,
    pub global_max: Option<Vec<i64>>,
    pub local_max: Option<Vec<i64>>,
    pub shared_max: i64,
    pub tensor_cores: Vec<TensorCore>,
}

impl Device {
    pub fn target(&self) -> TargetSpec {
        match self {
            Device::Cpu => TargetSpec {
                device: *self,
                has_local: false,
                supports_float4: false,
                has_image: false,
                global_max: None,
                local_max: None,
                shared_max: 0,
                tensor_cores: vec![],
            },
            Device::OpenCl => TargetSpec {
                device: *self,
                has_local: true,
                supports_float4: true,
                has_image: true,
                global_max: Some(vec![65536, 65536, 65536]),
                local_max: Some(vec![256, 256, 256]),
                shared_max: 32 * 1024,
                tensor_cores: vec![],
            },
            Device::Cuda => TargetSpec {
                device: *self,
                has_local: true,
                supports_float4: true,
                has_image: false,
                global_max: Some(vec![2147483647, 65535, 65535]),
                local_max: Some(vec![1024, 1024, 64]),
                shared_max: 48 * 1024,
                tensor_cores: vec![],
            },
            Device::Metal => TargetSpec {
                device: *self,
                has_local: true,
                supports_float4: true,
                has_image: false,
                global_max: Some(vec![2147483647, 2147483647, 2147483647]),
                local_max: Some(vec![1024, 1024, 1024]),
                shared_max: 32 * 1024,
                // simdgroup 8x8x8; each thread holds 2-element slices, which
                // is what the lowering tiles by
                tensor_cores: vec![TensorCore {
                    dims: (2, 2, 2),
                    dtype_in: DType::F32,
                    dtype_out: DType::F32,
                }],
            },
        }
    }
}

/// A compiled kernel plus everything needed to launch it. `uops` carries the
/// ordered program for drivers that execute the IR directly (the CPU
/// interpreter); source-consuming drivers ignore it.
pub struct Program {
    pub name: String,
    pub source: String,
    pub uops: Vec<UOpRef>,
    pub global_size: Vec<i64>,
    pub local_size: Vec<i64>,
}

pub trait CompiledKernel {
    fn launch(&self, bufs: &[BufferHandle]) -> Result<()>;
}

/// External collaborator contract: turn a rendered program into something
/// launchable. Implementations own their device state.
pub trait Driver {
    fn compile(&self, prog: &Program) -> Result<Box<dyn CompiledKernel>>;
}

/// Owned by the embedder; the scheduler looks drivers up per device.
#[derive(Default)]
pub struct DeviceRegistry {
    drivers: HashMap<Device, Rc<dyn Driver>>,
}

impl DeviceRegistry {
    pub fn new() -> DeviceRegistry {
        DeviceRegistry::default()
    }

    /// A registry with the built-in CPU interpreter installed.
    pub fn with_defaults() -> DeviceRegistry {
        let mut reg = DeviceRegistry::new();
        reg.register(Device::Cpu, Rc::new(crate::interp::CpuDriver));
        reg
    }

    pub fn register(&mut self, device: Device, driver: Rc<dyn Driver>) {
        self.drivers.insert(device, driver);
    }

    pub fn driver(&self, device: Device) -> Result<Rc<dyn Driver>> {
        self.drivers
            .get(&device)
            .cloned()
            .ok_or_else(|| Error::NoDriver {
                device: device.to_string(),
            })
    }
}
