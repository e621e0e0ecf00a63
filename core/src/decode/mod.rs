//! Decode plane: the edge-driven sample scanner, concrete protocol
//! decoders, and the decoder manager that drives them.

pub mod i2c;
pub mod manager;
pub mod runtime;
pub mod spi;
pub mod uart;

pub use manager::{DecoderInfo, DecoderKind, DecoderManager, ExecutionResult, OptionSpec, DEFAULT_CHUNK_SAMPLES};
pub use runtime::{all_of, any_of, Annotation, DecoderError, DecoderResult, EdgeKind, Scanner, WaitConditions, WaitOutcome};
