pub mod fixed;
pub mod graph;
pub mod op;

pub use fixed::FixedMul;
pub use graph::{AlignedLayout, DType, Graph, QuantParams, RangeSource, Tensor, TensorId, TensorKind};
pub use op::{
    ActFunc, Activation, Add, AddRequant, LaneAttrs, Matmul, MatmulAttrs, Normalize, OpId,
    OpKind, Operator, Requant, Stationary,
};
