pub mod fixtures;
mod hooks_and_tools;
mod ordering;
