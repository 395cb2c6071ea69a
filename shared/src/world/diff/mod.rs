mod array_diff;

pub use array_diff::{apply_splices, compute_splices, SpliceInstruction};
