// Multi-dimensional LSTM
//
//   parameters  gate kernels of one scan direction
//   engine      the column-by-column recurrence of one direction
//   composer    scan directions, config, classifier
//   block       MDLSTM applied block-wise through tensor chunking

pub mod block;
pub mod composer;
pub mod engine;
pub mod parameters;

pub use block::BlockMdlstm;
pub use composer::{
    DirectionMode, DirectionSet, MdlstmConfig, MultiDimensionalLstm, Parallelism, ScanDirection,
    DEFAULT_NUM_CLASSES,
};
pub use engine::{MdlstmEngine, OutputGating};
pub use parameters::{GateResponses, MdlstmParameters, DEFAULT_DROPOUT_P, FORGET_GATE_BIAS};
