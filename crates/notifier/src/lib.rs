pub mod backoff;
pub mod channels;
pub mod dispatcher;
