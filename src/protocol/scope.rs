use thiserror::Error;

use super::ids::{ConnectionId, GroupId};

/// Who receives a relayed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Every connection registered under the session.
    All,
    TeacherOnly,
    StudentOnly(ConnectionId),
    GroupOnly(GroupId),
}

/// Scope as requested on the wire, before the sender's group is looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeRequest {
    All,
    Teacher,
    Student(ConnectionId),
    SenderGroup,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScopeError {
    #[error("scope flags oft/ofs/ofg are mutually exclusive")]
    Conflicting,
}

impl ScopeRequest {
    /// `oft` and `ofg` count by presence alone, like the browser client sets them.
    pub fn from_flags(
        oft: bool,
        ofs: Option<ConnectionId>,
        ofg: bool,
    ) -> Result<Self, ScopeError> {
        match (oft, ofs, ofg) {
            (false, None, false) => Ok(ScopeRequest::All),
            (true, None, false) => Ok(ScopeRequest::Teacher),
            (false, Some(id), false) => Ok(ScopeRequest::Student(id)),
            (false, None, true) => Ok(ScopeRequest::SenderGroup),
            _ => Err(ScopeError::Conflicting),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_flag_selects_scope() {
        assert_eq!(ScopeRequest::from_flags(false, None, false), Ok(ScopeRequest::All));
        assert_eq!(ScopeRequest::from_flags(true, None, false), Ok(ScopeRequest::Teacher));
        assert_eq!(
            ScopeRequest::from_flags(false, Some(ConnectionId(4)), false),
            Ok(ScopeRequest::Student(ConnectionId(4)))
        );
        assert_eq!(ScopeRequest::from_flags(false, None, true), Ok(ScopeRequest::SenderGroup));
    }

    #[test]
    fn combined_flags_are_rejected() {
        assert_eq!(
            ScopeRequest::from_flags(true, None, true),
            Err(ScopeError::Conflicting)
        );
        assert_eq!(
            ScopeRequest::from_flags(true, Some(ConnectionId(1)), false),
            Err(ScopeError::Conflicting)
        );
    }
}
