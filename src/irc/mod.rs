pub mod codec;
pub mod mesh;
pub mod message;
pub mod relaymsg;
pub mod server;
