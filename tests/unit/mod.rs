/// Unit tests exercising the public building blocks from outside the crate
mod envelope_tests;
mod gate_tests;
mod storage_tests;
