pub mod registry;
pub mod server;
pub mod wol;
