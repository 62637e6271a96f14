//! Envelopes sent by browsers, after decryption.

use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer, Serialize};
use simd_json::{OwnedValue, StaticNode};
use thiserror::Error;

use super::ids::{ConnectionId, GroupId, SessionId, UserId};
use super::scope::{ScopeError, ScopeRequest};

/// Routing fields every envelope may carry next to its action.
#[derive(Debug, Default, Deserialize)]
pub struct Header {
    #[serde(default)]
    pub sid: Option<SessionId>,
    #[serde(default)]
    oft: Option<IgnoredAny>,
    #[serde(default)]
    ofs: Option<ConnectionId>,
    #[serde(default)]
    ofg: Option<IgnoredAny>,
}

impl Header {
    pub fn scope(&self) -> Result<ScopeRequest, ScopeError> {
        ScopeRequest::from_flags(self.oft.is_some(), self.ofs, self.ofg.is_some())
    }
}

/// Question the message refers to. Both ids are forwarded untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuestionRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<OwnedValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jqid: Option<OwnedValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserType {
    Teacher,
    Student,
    /// Any other role string; identification with it changes nothing.
    Other(String),
}

impl<'de> Deserialize<'de> for UserType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let kind = lenient_text(deserializer)?;
        Ok(match kind.as_str() {
            "teacher" => UserType::Teacher,
            "student" => UserType::Student,
            _ => UserType::Other(kind),
        })
    }
}

/// Display fields are forwarded, not interpreted: null reads as empty and
/// other non-string values keep their JSON text.
fn lenient_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match OwnedValue::deserialize(deserializer)? {
        OwnedValue::String(text) => text,
        OwnedValue::Static(StaticNode::Null) => String::new(),
        other => other.to_string(),
    })
}

/// Payload of `newuser`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Identity {
    pub usertype: UserType,
    pub userid: UserId,
    #[serde(default, deserialize_with = "lenient_text")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub pic: String,
    #[serde(default)]
    pub cmid: Option<OwnedValue>,
}

/// Payload of `newgroup`: the group plus the member joining it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GroupIdentity {
    pub groupid: GroupId,
    #[serde(default, deserialize_with = "lenient_text")]
    pub groupname: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub grouppic: String,
    pub userid: UserId,
    #[serde(default, deserialize_with = "lenient_text")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub pic: String,
    #[serde(default)]
    pub cmid: Option<OwnedValue>,
}

/// Every action the server understands. Anything else is `Unknown` and ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action")]
pub enum Action {
    #[serde(rename = "newuser")]
    NewUser(Identity),
    #[serde(rename = "newgroup")]
    NewGroup(GroupIdentity),
    #[serde(rename = "countusers")]
    CountUsers {},

    #[serde(rename = "question")]
    Question {
        #[serde(default)]
        context: Option<OwnedValue>,
    },
    #[serde(rename = "pauseQuestion")]
    PauseQuestion(QuestionRef),
    #[serde(rename = "playQuestion")]
    PlayQuestion(QuestionRef),
    #[serde(rename = "showAnswers")]
    ShowAnswers(QuestionRef),
    #[serde(rename = "hideAnswers")]
    HideAnswers(QuestionRef),
    #[serde(rename = "showStatistics")]
    ShowStatistics(QuestionRef),
    #[serde(rename = "hideStatistics")]
    HideStatistics(QuestionRef),
    #[serde(rename = "showFeedback")]
    ShowFeedback(QuestionRef),
    #[serde(rename = "hideFeedback")]
    HideFeedback(QuestionRef),
    #[serde(rename = "teacherQuestionEnd")]
    TeacherQuestionEnd {
        #[serde(default)]
        kid: Option<OwnedValue>,
        #[serde(default)]
        jqid: Option<OwnedValue>,
        #[serde(default)]
        statistics: Option<OwnedValue>,
    },

    #[serde(rename = "ranking")]
    Ranking {
        #[serde(default)]
        context: Option<OwnedValue>,
    },
    #[serde(rename = "endSession")]
    EndSession {
        #[serde(default)]
        context: Option<OwnedValue>,
    },

    #[serde(rename = "alreadyAnswered")]
    AlreadyAnswered {
        #[serde(default)]
        userid: Option<UserId>,
        #[serde(default)]
        kid: Option<OwnedValue>,
        #[serde(default)]
        jqid: Option<OwnedValue>,
    },
    #[serde(rename = "normalizeUser")]
    NormalizeUser {
        #[serde(default)]
        userid: Option<UserId>,
        #[serde(default)]
        kid: Option<OwnedValue>,
        #[serde(default)]
        jqid: Option<OwnedValue>,
    },

    #[serde(rename = "improvising")]
    Improvising(QuestionRef),
    #[serde(rename = "closeImprovise")]
    CloseImprovise(QuestionRef),
    #[serde(rename = "improvised")]
    Improvised(QuestionRef),
    #[serde(rename = "initVote")]
    InitVote(QuestionRef),
    #[serde(rename = "printNewTag")]
    PrintNewTag {
        #[serde(default)]
        kid: Option<OwnedValue>,
        #[serde(default)]
        jqid: Option<OwnedValue>,
        #[serde(default)]
        tags: Option<OwnedValue>,
    },
    #[serde(rename = "ImproviseStudentTag")]
    ImproviseStudentTag {
        #[serde(default)]
        userid: Option<UserId>,
        #[serde(default)]
        kid: Option<OwnedValue>,
        #[serde(default)]
        jqid: Option<OwnedValue>,
        #[serde(default)]
        usertag: Option<OwnedValue>,
    },
    #[serde(rename = "StudentVotedTag")]
    StudentVotedTag {
        #[serde(default)]
        userid: Option<UserId>,
        #[serde(default)]
        kid: Option<OwnedValue>,
        #[serde(default)]
        jqid: Option<OwnedValue>,
        #[serde(default)]
        votedtag: Option<OwnedValue>,
    },

    #[serde(rename = "ping")]
    Ping {},
    #[serde(rename = "diag")]
    Diag {},
    #[serde(rename = "shutdownTest")]
    ShutdownTest {},

    #[serde(other)]
    Unknown,
}

/// A decoded envelope.
#[derive(Debug)]
pub struct Inbound {
    pub header: Header,
    pub action: Action,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("not JSON: {0}")]
    NotJson(simd_json::Error),
    /// Valid JSON that does not fit any envelope.
    #[error("unexpected envelope shape: {0}")]
    Shape(simd_json::Error),
}

/// Parses decrypted text. Header and action are read in two passes over the
/// same bytes so neither type has to know about the other's fields.
pub fn parse(text: &str) -> Result<Inbound, ParseError> {
    let bytes = text.as_bytes().to_vec();
    let typed = simd_json::serde::from_slice::<Header>(&mut bytes.clone()).and_then(|header| {
        let action = simd_json::serde::from_slice::<Action>(&mut bytes.clone())?;
        Ok(Inbound { header, action })
    });
    typed.map_err(|err| match simd_json::to_owned_value(&mut bytes.clone()) {
        Ok(_) => ParseError::Shape(err),
        Err(_) => ParseError::NotJson(err),
    })
}

/// Matches the bare keepalive strings some clients send instead of an
/// envelope, tolerating surrounding whitespace.
pub fn keepalive(text: &str) -> Option<Action> {
    match text.trim() {
        "ping" => Some(Action::Ping {}),
        "diag" => Some(Action::Diag {}),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(json: &str) -> OwnedValue {
        let mut bytes = json.as_bytes().to_vec();
        simd_json::to_owned_value(&mut bytes).unwrap()
    }

    #[test]
    fn question_keeps_context_verbatim() {
        let parsed =
            parse(r#"{"action":"question","sid":5,"context":{"qid":3,"html":"<p>2+2</p>"}}"#)
                .unwrap();
        assert_eq!(parsed.header.sid, Some(SessionId::new("5")));
        assert_eq!(parsed.header.scope(), Ok(ScopeRequest::All));
        assert_eq!(
            parsed.action,
            Action::Question {
                context: Some(value(r#"{"qid":3,"html":"<p>2+2</p>"}"#))
            }
        );
    }

    #[test]
    fn identification_parses_role() {
        let parsed = parse(
            r#"{"action":"newuser","sid":"9","usertype":"teacher","userid":2,"name":"Ada","pic":"a.png","cmid":44}"#,
        )
        .unwrap();
        match parsed.action {
            Action::NewUser(identity) => {
                assert_eq!(identity.usertype, UserType::Teacher);
                assert_eq!(identity.userid, UserId::new("2"));
                assert_eq!(identity.name, "Ada");
                assert_eq!(identity.cmid, Some(value("44")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn scope_flags_are_read_from_the_header() {
        let parsed = parse(r#"{"action":"alreadyAnswered","sid":1,"ofg":true,"jqid":7}"#).unwrap();
        assert_eq!(parsed.header.scope(), Ok(ScopeRequest::SenderGroup));
        let parsed = parse(r#"{"action":"showAnswers","sid":1,"ofs":"3"}"#).unwrap();
        assert_eq!(parsed.header.scope(), Ok(ScopeRequest::Student(ConnectionId(3))));
        let parsed = parse(r#"{"action":"showAnswers","sid":1,"oft":1,"ofg":1}"#).unwrap();
        assert_eq!(parsed.header.scope(), Err(ScopeError::Conflicting));
    }

    #[test]
    fn unrecognised_action_is_unknown_not_an_error() {
        let parsed = parse(r#"{"action":"launchRockets","sid":1,"count":3}"#).unwrap();
        assert_eq!(parsed.action, Action::Unknown);
    }

    #[test]
    fn display_fields_tolerate_null_and_numbers() {
        let parsed = parse(
            r#"{"action":"newuser","sid":5,"usertype":"student","userid":7.0,"name":null,"pic":3}"#,
        )
        .unwrap();
        match parsed.action {
            Action::NewUser(identity) => {
                assert_eq!(identity.usertype, UserType::Student);
                assert_eq!(identity.userid, UserId::new("7"));
                assert_eq!(identity.name, "");
                assert_eq!(identity.pic, "3");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unfamiliar_usertype_is_kept_as_text() {
        let parsed =
            parse(r#"{"action":"newuser","sid":5,"usertype":"observer","userid":1}"#).unwrap();
        assert!(matches!(
            parsed.action,
            Action::NewUser(Identity { usertype: UserType::Other(ref kind), .. }) if kind == "observer"
        ));
    }

    #[test]
    fn valid_json_of_the_wrong_shape_is_told_apart_from_garbage() {
        assert!(matches!(parse(r#"{"sid":5}"#), Err(ParseError::Shape(_))));
        assert!(matches!(parse(r#"[1,2,3]"#), Err(ParseError::Shape(_))));
        assert!(matches!(
            parse(r#"{"action":"showAnswers","sid":5,"ofs":"teacher"}"#),
            Err(ParseError::Shape(_))
        ));
        assert!(matches!(parse("{not json"), Err(ParseError::NotJson(_))));
    }

    #[test]
    fn non_json_is_an_error_and_keepalives_are_recognised() {
        assert!(matches!(parse("ping"), Err(ParseError::NotJson(_))));
        assert_eq!(keepalive(" ping\n"), Some(Action::Ping {}));
        assert_eq!(keepalive("diag"), Some(Action::Diag {}));
        assert_eq!(keepalive("pong"), None);
    }
}
