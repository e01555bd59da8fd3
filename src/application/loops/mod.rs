pub mod channel;
pub(crate) mod remote_loop;
pub(crate) mod seal_loop;
