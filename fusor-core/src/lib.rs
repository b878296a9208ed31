//! A tensor compiler: user-level array ops build a lazy graph, the
//! scheduler cuts it into kernels, each kernel lowers through a typed
//! micro-op IR, a pattern rewriter canonicalises it, and a C-style renderer
//! emits source for the target device.

mod buffer;
mod context;
#[cfg(feature = "cuda")]
mod cuda;
mod device;
mod dtype;
mod error;
mod graph;
mod interp;
mod linearize;
mod pattern;
mod render;
mod rules;
mod schedule;
mod shapetracker;
mod symbolic;
mod tensor;
mod uop;
mod view;

pub use buffer::{Buffer, BufferData, BufferHandle};
pub use context::{CompileContext, CompileStats};
#[cfg(feature = "cuda")]
pub use cuda::CudaDriver;
pub use device::{CompiledKernel, Device, DeviceRegistry, Driver, Program, TargetSpec, TensorCore};
pub use dtype::{ConstVal, DType, Scalar};
pub use error::{Error, Result};
pub use graph::{Graph, LazyNode, Movement, NodeId, Op, OpKind};
pub use interp::CpuDriver;
pub use linearize::{linearize, Kernel, Lowered};
pub use pattern::{graph_rewrite, Bindings, Builder, NodePat, Pat, PatternMatcher, SrcPat};
pub use render::cstyle::{dialect_for, render, Dialect, CSTYLE_CPU, CUDA, METAL, OPENCL};
pub use render::{launch_dims, order_uops, print_uops, verify};
pub use rules::{expander, float4_folding, folder, image_folding};
pub use schedule::{realize, schedule, ScheduledKernel};
pub use shapetracker::ShapeTracker;
pub use symbolic::Node;
pub use tensor::{GraphTensor, LazyGraph, Tensor};
pub use uop::{exec_alu, AluOp, ReduceKind, UOp, UOpArg, UOpGraph, UOpKind, UOpRef, WmmaArg};
pub use view::{strides_for_shape, View};
