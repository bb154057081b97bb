//! Connection handshake state machine.
//!
//! `OPTIONS -> SUPPORTED -> STARTUP -> (AUTHENTICATE -> AUTH_RESPONSE loop)
//! -> READY [-> USE keyspace] [-> REGISTER]`, driven one decoded response at
//! a time. The machine owns no IO: `first_frame` and each `drive` call hand
//! back the encoded frame to write, and the caller feeds the next response
//! in.

use std::collections::HashMap;
use std::sync::Arc;

use crate::auth::{Authenticator, AuthenticatorProvider};
use crate::constant::{FrameFlags, ProtocolVersion};
use crate::error::{Error, Result};
use crate::protocol::request::{QueryParameters, Request};
use crate::protocol::response::{CqlResult, Response, ResponseKind};

/// The handshake owns stream 0; nothing else is in flight before READY.
const HANDSHAKE_STREAM: i16 = 0;

pub enum HandshakeAction {
    /// Write this frame and feed the next response back in.
    Write(Vec<u8>),
    /// Connection is READY.
    Done,
}

enum HandshakeState {
    AwaitSupported,
    AwaitStartupResponse,
    AwaitAuthResult,
    AwaitKeyspaceResult,
    AwaitRegisterResult,
    Done,
}

pub struct Handshake {
    version: ProtocolVersion,
    flags: FrameFlags,
    keyspace: Option<String>,
    register_events: Vec<&'static str>,
    auth_provider: Option<Arc<dyn AuthenticatorProvider>>,
    authenticator: Option<Box<dyn Authenticator>>,
    supported: HashMap<String, Vec<String>>,
    state: HandshakeState,
}

impl Handshake {
    pub fn new(
        version: ProtocolVersion,
        beta: bool,
        keyspace: Option<String>,
        register_events: Vec<&'static str>,
        auth_provider: Option<Arc<dyn AuthenticatorProvider>>,
    ) -> Self {
        let flags = if beta && version == ProtocolVersion::V5 {
            FrameFlags::BETA
        } else {
            FrameFlags::empty()
        };
        Self {
            version,
            flags,
            keyspace,
            register_events,
            auth_provider,
            authenticator: None,
            supported: HashMap::new(),
            state: HandshakeState::AwaitSupported,
        }
    }

    /// Server-advertised options from SUPPORTED, available once past that
    /// state.
    pub fn supported_options(&self) -> &HashMap<String, Vec<String>> {
        &self.supported
    }

    fn encode(&self, request: &Request<'_>) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        request.encode(self.version, HANDSHAKE_STREAM, self.flags, None, &mut out)?;
        Ok(out)
    }

    /// The OPTIONS frame that opens the exchange.
    pub fn first_frame(&self) -> Result<Vec<u8>> {
        self.encode(&Request::Options)
    }

    /// After READY: either switch keyspace, register for events, or finish.
    fn after_ready(&mut self) -> Result<HandshakeAction> {
        if let Some(keyspace) = self.keyspace.take() {
            self.state = HandshakeState::AwaitKeyspaceResult;
            let query = format!("USE \"{keyspace}\"");
            let params = QueryParameters::default();
            return self.encode(&Request::Query {
                query: &query,
                params: &params,
            })
            .map(HandshakeAction::Write);
        }
        self.register_or_finish()
    }

    fn register_or_finish(&mut self) -> Result<HandshakeAction> {
        if self.register_events.is_empty() {
            self.state = HandshakeState::Done;
            return Ok(HandshakeAction::Done);
        }
        self.state = HandshakeState::AwaitRegisterResult;
        let events = std::mem::take(&mut self.register_events);
        self.encode(&Request::Register { events: &events })
            .map(HandshakeAction::Write)
    }

    fn auth_response(&mut self, token: Option<Vec<u8>>) -> Result<HandshakeAction> {
        self.state = HandshakeState::AwaitAuthResult;
        self.encode(&Request::AuthResponse {
            token: token.as_deref(),
        })
        .map(HandshakeAction::Write)
    }

    /// Drive the state machine with one decoded response.
    pub fn drive(&mut self, response: Response) -> Result<HandshakeAction> {
        if let ResponseKind::Error(err) = response.kind {
            return Err(Error::Server(err));
        }
        match self.state {
            HandshakeState::AwaitSupported => {
                let ResponseKind::Supported { options } = response.kind else {
                    return Err(Error::UnexpectedResponse("expected SUPPORTED"));
                };
                self.supported = options;
                self.state = HandshakeState::AwaitStartupResponse;
                self.encode(&Request::Startup).map(HandshakeAction::Write)
            }
            HandshakeState::AwaitStartupResponse => match response.kind {
                ResponseKind::Ready => self.after_ready(),
                ResponseKind::Authenticate { class } => {
                    let provider = self.auth_provider.as_ref().ok_or_else(|| {
                        Error::Auth(format!(
                            "server requires authentication ({class}) but no credentials or \
                             authenticator were configured"
                        ))
                    })?;
                    let mut authenticator = provider.new_authenticator(&class)?;
                    let token = authenticator.initial_response()?;
                    self.authenticator = Some(authenticator);
                    self.auth_response(token)
                }
                _ => Err(Error::UnexpectedResponse("expected READY or AUTHENTICATE")),
            },
            HandshakeState::AwaitAuthResult => match response.kind {
                ResponseKind::AuthChallenge { token } => {
                    let authenticator = self
                        .authenticator
                        .as_mut()
                        .ok_or(Error::InvalidState("auth challenge without authenticator"))?;
                    let token = authenticator.evaluate_challenge(token.as_deref())?;
                    self.auth_response(token)
                }
                ResponseKind::AuthSuccess { token } => {
                    if let Some(authenticator) = self.authenticator.as_mut() {
                        authenticator.on_success(token.as_deref())?;
                    }
                    self.after_ready()
                }
                _ => Err(Error::UnexpectedResponse(
                    "expected AUTH_CHALLENGE or AUTH_SUCCESS",
                )),
            },
            HandshakeState::AwaitKeyspaceResult => match response.kind {
                ResponseKind::Result(CqlResult::SetKeyspace(_)) => self.register_or_finish(),
                _ => Err(Error::UnexpectedResponse("expected RESULT(set_keyspace)")),
            },
            HandshakeState::AwaitRegisterResult => match response.kind {
                ResponseKind::Ready => {
                    self.state = HandshakeState::Done;
                    Ok(HandshakeAction::Done)
                }
                _ => Err(Error::UnexpectedResponse("expected READY after REGISTER")),
            },
            HandshakeState::Done => Err(Error::InvalidState("handshake already complete")),
        }
    }
}
