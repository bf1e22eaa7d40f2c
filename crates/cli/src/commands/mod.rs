pub mod ask;
pub mod config_cmd;
pub mod notes;
pub mod serve;
