pub mod hf_backend;

pub mod tensor_ext;
