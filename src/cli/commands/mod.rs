pub mod contribute;
