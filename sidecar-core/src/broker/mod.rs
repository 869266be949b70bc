//! Subscription broker (the sidecar)
//!
//! Lets many worker processes share the one upstream connection over two
//! local TCP transports:
//! - call channel: multiplexed request/response by id
//! - event channel: subscribe/unsubscribe with acks, then pushed events
//!
//! Restarting the broker loses only the local channel map; workers
//! resubscribe when they reconnect.

pub mod fanout;
pub mod protocol;
pub mod server;

pub use fanout::{FrameSink, LocalConnId, SubscriptionBroker};
pub use protocol::{
    read_frame, CallRequest, CallResponse, EventFrame, EventPush, EventReply, EventRequest, Frame,
    MAX_FRAME_BYTES,
};
pub use server::{BrokerServer, BrokerServerConfig};
