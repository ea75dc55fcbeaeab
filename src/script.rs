//! Embedded scripting capability
//!
//! User scripts may observe and mutate proxied traffic. The script engine is
//! external; the proxy only calls these hooks. With no script loaded every
//! hook is a pass-through.

use bytes::Bytes;
use http::{Request, Response};

/// Outcome of running a script's request hook.
pub enum ScriptVerdict {
    /// Replace the outgoing request and continue the pipeline.
    Replace(Request<Bytes>),

    /// Short-circuit with a synthetic response; the request is not forwarded.
    Respond(Response<Bytes>),
}

/// Request/response mutation contract offered to user scripts.
pub trait ScriptHook: Send + Sync {
    /// Called before the request is forwarded upstream.
    fn on_request(&self, _req: &Request<Bytes>) -> Option<ScriptVerdict> {
        None
    }

    /// Called after the upstream response has been read; a `Some` return
    /// replaces the response sent to the victim.
    fn on_response(&self, _req: &Request<Bytes>, _res: &Response<Bytes>) -> Option<Response<Bytes>> {
        None
    }

    /// Interactive-shell escape hatch; returns true when the script consumed
    /// the command. Unused by the engine itself, cleared on proxy shutdown.
    fn on_unknown_command(&self, _line: &str) -> bool {
        false
    }
}

/// The no-script default: every hook passes through.
#[derive(Debug, Default)]
pub struct NoopScript;

impl ScriptHook for NoopScript {}
