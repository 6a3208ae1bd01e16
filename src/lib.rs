pub mod app;
pub mod constants;
pub mod errors;

pub mod managers {
    pub mod runner;
    pub mod setup;
    pub mod status;
    pub mod transfer;
}

pub mod mcp {
    pub mod catalog;
    pub mod protocol;
    pub mod server;
}

pub mod services {
    pub mod config;
    pub mod logger;
    pub mod session;
    pub mod ssh;
    pub mod tool_executor;
    pub mod tool_paths;
    pub mod validation;
}

pub mod utils {
    pub mod fs_atomic;
    pub mod scratch;
    pub mod shell;
    pub mod text;
    pub mod user_paths;
}
