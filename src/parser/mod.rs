pub mod modelfile;

pub use modelfile::{parse, Command};
