//! The JSON vocabulary spoken inside frames.

pub mod ids;
pub mod inbound;
pub mod outbound;
pub mod scope;

pub use ids::{ConnectionId, GroupId, SessionId, UserId};
pub use inbound::{Action, GroupIdentity, Header, Identity, Inbound, QuestionRef, UserType};
pub use outbound::{GroupSummary, Outbound, StudentSummary};
pub use scope::{Scope, ScopeError, ScopeRequest};
