pub mod llama_server;

pub use llama_server::LlamaServerRuntime;
