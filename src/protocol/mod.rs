pub mod packet;
pub mod primitive;
pub mod rpc;
pub mod token;
pub mod type_info;
