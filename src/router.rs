//! Turns decrypted envelopes into registry changes and outbound messages.

use log::{debug, trace, warn};
use thiserror::Error;

use crate::protocol::inbound::{self, Action, Inbound, ParseError, QuestionRef, UserType};
use crate::protocol::{ConnectionId, Outbound, Scope, ScopeError, ScopeRequest, SessionId};
use crate::session::{Effect, SessionRegistry};

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("invalid message: {0}")]
    Invalid(#[from] ParseError),
    #[error("message does not decrypt with the shared secret")]
    Undecryptable,
    #[error("message has no sid")]
    MissingSession,
    #[error(transparent)]
    Scope(#[from] ScopeError),
    #[error("sender {0} is not in a group")]
    NoGroup(ConnectionId),
}

/// Counters kept across messages, reported by the idle hook.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RouterStats {
    pub routed: u64,
    pub dropped: u64,
    pub rejected: u64,
}

#[derive(Debug, Default)]
pub struct MessageRouter {
    stats: RouterStats,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    /// Routes one decrypted message from `sender`. `live_connections` feeds
    /// the `diag` reply.
    pub fn route(
        &mut self,
        registry: &mut SessionRegistry,
        sender: ConnectionId,
        text: &str,
        live_connections: usize,
    ) -> Vec<Effect> {
        let inbound = match inbound::parse(text) {
            Ok(inbound) => inbound,
            Err(ParseError::Shape(err)) => {
                debug!("{sender}: envelope ignored: {err}");
                self.stats.dropped += 1;
                return Vec::new();
            }
            Err(err) => match inbound::keepalive(text) {
                Some(action) => Inbound {
                    header: Default::default(),
                    action,
                },
                None => return self.reject(registry, sender, RouteError::Invalid(err)),
            },
        };

        match self.dispatch(registry, sender, inbound, live_connections) {
            Ok(effects) => {
                self.stats.routed += 1;
                effects
            }
            Err(err) => self.reject(registry, sender, err),
        }
    }

    /// Answer for a payload that failed decryption before reaching the router.
    pub fn undecryptable(&mut self, registry: &SessionRegistry, sender: ConnectionId) -> Vec<Effect> {
        self.reject(registry, sender, RouteError::Undecryptable)
    }

    fn reject(&mut self, registry: &SessionRegistry, sender: ConnectionId, err: RouteError) -> Vec<Effect> {
        let sid = registry.peer(sender).map(|peer| peer.sid.clone());
        match err {
            RouteError::Invalid(_) | RouteError::Undecryptable => {
                warn!("{sender}: {err}, disconnecting");
                self.stats.rejected += 1;
                vec![
                    Effect::Send {
                        to: sender,
                        message: Outbound::Error {
                            sid,
                            message: "invalid message".to_string(),
                        },
                    },
                    Effect::Disconnect(sender),
                ]
            }
            RouteError::MissingSession => {
                warn!("{sender}: {err}");
                self.stats.rejected += 1;
                vec![Effect::Send {
                    to: sender,
                    message: Outbound::Error {
                        sid,
                        message: err.to_string(),
                    },
                }]
            }
            RouteError::Scope(_) | RouteError::NoGroup(_) => {
                warn!("{sender}: {err}, message dropped");
                self.stats.dropped += 1;
                Vec::new()
            }
        }
    }

    fn dispatch(
        &mut self,
        registry: &mut SessionRegistry,
        sender: ConnectionId,
        inbound: Inbound,
        live_connections: usize,
    ) -> Result<Vec<Effect>, RouteError> {
        let Inbound { header, action } = inbound;
        // a registered connection always speaks for its own session
        let sid = registry
            .peer(sender)
            .map(|peer| peer.sid.clone())
            .or_else(|| header.sid.clone());

        let effects = match action {
            Action::NewUser(identity) => {
                let sid = header.sid.ok_or(RouteError::MissingSession)?;
                match identity.usertype {
                    UserType::Teacher => registry.register_teacher(sender, sid, &identity),
                    UserType::Student => registry.register_student(sender, sid, &identity),
                    UserType::Other(ref kind) => {
                        debug!("{sender}: ignoring newuser with usertype {kind:?}");
                        Vec::new()
                    }
                }
            }
            Action::NewGroup(identity) => {
                let sid = header.sid.ok_or(RouteError::MissingSession)?;
                registry.register_group_member(sender, sid, &identity)
            }
            Action::CountUsers {} => {
                let sid = sid.ok_or(RouteError::MissingSession)?;
                let count = registry.student_count(&sid);
                reply(sender, Outbound::CountUsers { sid, count })
            }
            Action::Ping {} => reply(
                sender,
                Outbound::Connect {
                    sid: sid.unwrap_or_default(),
                },
            ),
            Action::Diag {} => {
                let sid = sid.unwrap_or_default();
                let snapshot = registry.snapshot(&sid);
                reply(
                    sender,
                    Outbound::Diag {
                        sid,
                        teacher: snapshot.teacher,
                        students: snapshot.students,
                        groups: snapshot.groups,
                        connections: live_connections,
                    },
                )
            }
            Action::ShutdownTest {} => vec![
                Effect::Send {
                    to: sender,
                    message: Outbound::ShutdownTest {
                        sid: sid.unwrap_or_default(),
                    },
                },
                Effect::Disconnect(sender),
            ],
            Action::Unknown => {
                debug!("{sender}: ignoring unrecognised action");
                Vec::new()
            }
            relayed => {
                let Some(sid) = sid else {
                    debug!("{sender}: relay without a session, dropped");
                    return Ok(Vec::new());
                };
                let scope = self.resolve_scope(registry, sender, &sid, header.scope()?)?;
                match project(sid.clone(), relayed) {
                    Some(message) => relay(registry, sender, &sid, &scope, message),
                    None => Vec::new(),
                }
            }
        };
        Ok(effects)
    }

    fn resolve_scope(
        &self,
        registry: &SessionRegistry,
        sender: ConnectionId,
        sid: &SessionId,
        request: ScopeRequest,
    ) -> Result<Scope, RouteError> {
        Ok(match request {
            ScopeRequest::All => Scope::All,
            ScopeRequest::Teacher => Scope::TeacherOnly,
            ScopeRequest::Student(id) => Scope::StudentOnly(id),
            ScopeRequest::SenderGroup => {
                let groupid = registry
                    .peer(sender)
                    .and_then(|peer| registry.resolve_group_of(sid, &peer.userid))
                    .ok_or(RouteError::NoGroup(sender))?;
                Scope::GroupOnly(groupid)
            }
        })
    }
}

fn reply(to: ConnectionId, message: Outbound) -> Vec<Effect> {
    vec![Effect::Send { to, message }]
}

fn relay(
    registry: &SessionRegistry,
    sender: ConnectionId,
    sid: &SessionId,
    scope: &Scope,
    message: Outbound,
) -> Vec<Effect> {
    let targets = registry.targets(sid, scope, sender);
    trace!(
        "{sender}: {} to {} target(s) in session {sid}",
        message.name(),
        targets.len()
    );
    targets
        .into_iter()
        .map(|to| Effect::Send {
            to,
            message: message.clone(),
        })
        .collect()
}

/// Outbound form of a relayed action; `None` for actions handled elsewhere.
fn project(sid: SessionId, action: Action) -> Option<Outbound> {
    let message = match action {
        Action::Question { context } => Outbound::Question { sid, context },
        Action::PauseQuestion(question) => Outbound::PauseQuestion { sid, question },
        Action::PlayQuestion(question) => Outbound::PlayQuestion { sid, question },
        Action::ShowAnswers(question) => Outbound::ShowAnswers { sid, question },
        Action::HideAnswers(question) => Outbound::HideAnswers { sid, question },
        Action::ShowStatistics(question) => Outbound::ShowStatistics { sid, question },
        Action::HideStatistics(question) => Outbound::HideStatistics { sid, question },
        Action::ShowFeedback(question) => Outbound::ShowFeedback { sid, question },
        Action::HideFeedback(question) => Outbound::HideFeedback { sid, question },
        Action::TeacherQuestionEnd {
            kid,
            jqid,
            statistics,
        } => Outbound::TeacherQuestionEnd {
            sid,
            question: QuestionRef { kid, jqid },
            statistics,
        },
        Action::Ranking { context } => Outbound::Ranking { sid, context },
        Action::EndSession { context } => Outbound::EndSession { sid, context },
        Action::AlreadyAnswered { userid, kid, jqid } => Outbound::AlreadyAnswered {
            sid,
            userid,
            question: QuestionRef { kid, jqid },
        },
        Action::NormalizeUser { userid, kid, jqid } => Outbound::NormalizeUser {
            sid,
            userid,
            question: QuestionRef { kid, jqid },
        },
        Action::Improvising(question) => Outbound::Improvising { sid, question },
        Action::CloseImprovise(question) => Outbound::CloseImprovise { sid, question },
        Action::Improvised(question) => Outbound::Improvised { sid, question },
        Action::InitVote(question) => Outbound::InitVote { sid, question },
        Action::PrintNewTag { kid, jqid, tags } => Outbound::PrintNewTag {
            sid,
            question: QuestionRef { kid, jqid },
            tags,
        },
        Action::ImproviseStudentTag {
            userid,
            kid,
            jqid,
            usertag,
        } => Outbound::ImproviseStudentTag {
            sid,
            userid,
            question: QuestionRef { kid, jqid },
            usertag,
        },
        Action::StudentVotedTag {
            userid,
            kid,
            jqid,
            votedtag,
        } => Outbound::StudentVotedTag {
            sid,
            userid,
            question: QuestionRef { kid, jqid },
            votedtag,
        },
        Action::NewUser(_)
        | Action::NewGroup(_)
        | Action::CountUsers {}
        | Action::Ping {}
        | Action::Diag {}
        | Action::ShutdownTest {}
        | Action::Unknown => return None,
    };
    Some(message)
}
