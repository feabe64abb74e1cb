//! Login sequence as an explicit state machine.
//!
//! Greeting (220) → `USER` → `PASS` (skipped on 230) → `FEAT` → `TYPE I` → ready.
//! A failed `FEAT` only means the server advertises no extensions.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::{Command, Completion, Reply, ReplyPayload, ServerFeatures, SessionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    AwaitGreeting,
    User,
    Pass,
    Feat,
    Type,
    Done,
    Failed,
}

/// What the session should do after feeding the handshake a reply.
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeAction {
    /// Nothing to send; keep waiting for the server.
    Wait,
    Send(Command),
    /// Login finished, carrying the parsed FEAT set.
    Ready(ServerFeatures),
    Fail(FtpError),
}

#[derive(Debug, Clone)]
pub struct Handshake {
    step: HandshakeStep,
    user: String,
    password: Option<String>,
    features: ServerFeatures,
    greeting: Option<String>,
}

impl Handshake {
    pub fn new(user: impl Into<String>, password: Option<String>) -> Self {
        Self {
            step: HandshakeStep::AwaitGreeting,
            user: user.into(),
            password,
            features: ServerFeatures::default(),
            greeting: None,
        }
    }

    pub fn step(&self) -> HandshakeStep {
        self.step
    }

    pub fn greeting(&self) -> Option<&str> {
        self.greeting.as_deref()
    }

    pub fn is_done(&self) -> bool {
        self.step == HandshakeStep::Done
    }

    /// Session state implied by the current step.
    pub fn session_state(&self) -> SessionState {
        match self.step {
            HandshakeStep::AwaitGreeting => SessionState::Unauthenticated,
            HandshakeStep::User => SessionState::Connected,
            HandshakeStep::Pass => SessionState::Authenticating,
            HandshakeStep::Feat | HandshakeStep::Type | HandshakeStep::Done => {
                SessionState::Authorized
            }
            HandshakeStep::Failed => SessionState::Closed,
        }
    }

    /// Handle the unsolicited greeting.
    pub fn on_greeting(&mut self, reply: &Reply) -> HandshakeAction {
        debug_assert_eq!(self.step, HandshakeStep::AwaitGreeting);
        match reply.code {
            220 => {
                self.greeting = Some(reply.text.clone());
                self.step = HandshakeStep::User;
                HandshakeAction::Send(Command::with_arg("USER", self.user.clone()))
            }
            100..=199 => HandshakeAction::Wait,
            code if code >= 400 => self.fail(FtpError::from_reply(code, &reply.text)),
            code => self.fail(FtpError::unexpected_reply(
                code,
                format!("Unexpected greeting: {}", reply.text),
            )),
        }
    }

    /// Handle the terminal outcome of the command sent for the current step.
    pub fn advance(&mut self, outcome: FtpResult<Completion>) -> HandshakeAction {
        match self.step {
            HandshakeStep::User => match outcome {
                Ok(Completion {
                    payload: ReplyPayload::NeedPassword(true),
                    ..
                }) => match self.password.clone() {
                    Some(password) => {
                        self.step = HandshakeStep::Pass;
                        HandshakeAction::Send(Command::with_arg("PASS", password))
                    }
                    None => self.fail(FtpError::auth_failed("Password required").with_code(331)),
                },
                Ok(_) => self.request_features(),
                Err(e) => self.fail(login_error(e)),
            },
            HandshakeStep::Pass => match outcome {
                Ok(Completion {
                    payload: ReplyPayload::NeedPassword(false),
                    ..
                }) => self.request_features(),
                Ok(c) => self.fail(FtpError::auth_failed(format!(
                    "Login not completed: {}",
                    c.text
                ))
                .with_code(c.code)),
                Err(e) => self.fail(login_error(e)),
            },
            HandshakeStep::Feat => {
                match outcome {
                    Ok(c) => self.features = ServerFeatures::from_feat_text(&c.text),
                    Err(e) => {
                        log::warn!("FEAT not available, assuming no extensions: {}", e);
                        self.features = ServerFeatures::default();
                    }
                }
                self.step = HandshakeStep::Type;
                HandshakeAction::Send(Command::with_arg("TYPE", "I"))
            }
            HandshakeStep::Type => match outcome {
                Ok(_) => {
                    self.step = HandshakeStep::Done;
                    HandshakeAction::Ready(self.features.clone())
                }
                Err(e) => self.fail(e),
            },
            HandshakeStep::AwaitGreeting | HandshakeStep::Done | HandshakeStep::Failed => {
                HandshakeAction::Fail(FtpError::invalid_state(format!(
                    "No login step pending (at {:?})",
                    self.step
                )))
            }
        }
    }

    fn request_features(&mut self) -> HandshakeAction {
        self.step = HandshakeStep::Feat;
        HandshakeAction::Send(Command::new("FEAT"))
    }

    fn fail(&mut self, error: FtpError) -> HandshakeAction {
        self.step = HandshakeStep::Failed;
        HandshakeAction::Fail(error)
    }
}

fn login_error(e: FtpError) -> FtpError {
    if e.is_protocol() {
        FtpError::auth_failed(e.message).with_code(e.code.unwrap_or(530))
    } else {
        e
    }
}
