use shmbus::Message;

pub const ARENA: &str = "/shmbus-demo";
pub const PINGS: &str = "/shmbus-demo-ping";
pub const PONGS: &str = "/shmbus-demo-pong";

#[derive(Message)]
#[repr(C)]
#[message(name = "demo.ping")]
pub struct Ping {
    pub seq: u32,
}

#[derive(Message)]
#[repr(C)]
#[message(name = "demo.pong")]
pub struct Pong {
    pub seq: u32,
}

#[derive(Message)]
#[repr(C)]
#[message(name = "demo.done")]
pub struct Done;
