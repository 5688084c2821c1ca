//! Slack transport for the kaiwa bot: Socket Mode and HTTP Events API
//! delivery, listener routing and the Slack Web API client.

mod slack_helpers;
pub mod slack_runtime;

pub use slack_runtime::{
    run_socket_mode, slack_events_router, verify_slack_signature, SlackApiError, SlackBridge,
    SlackBridgeRuntimeConfig, SLACK_EVENTS_PATH,
};
