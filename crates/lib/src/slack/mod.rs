//! Slack transport: Web API client (send, directories, rtm.connect) and the RTM websocket loop.

mod api;
mod event;
mod rtm;

pub use api::{check_ok, next_cursor, reply_request, ApiError, RtmSession, SlackApi};
pub use event::{decode_frame, Frame};
pub use rtm::{RtmClient, RtmError};
