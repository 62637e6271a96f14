//! Envelopes the server sends. Each variant is a fixed projection of the
//! inbound fields it was built from; opaque payloads are never inspected.

use serde::Serialize;
use simd_json::OwnedValue;

use super::ids::{ConnectionId, GroupId, SessionId, UserId};
use super::inbound::QuestionRef;

/// One line of the student roster sent with `newuser`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StudentSummary {
    pub userid: UserId,
    pub name: String,
    pub picture: String,
    pub usersocketid: ConnectionId,
}

/// One line of the group roster sent with `newgroup`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSummary {
    pub groupid: GroupId,
    pub name: String,
    pub picture: String,
    pub numusers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action")]
pub enum Outbound {
    #[serde(rename = "newuser")]
    NewUser {
        sid: SessionId,
        students: Vec<StudentSummary>,
        count: usize,
    },
    #[serde(rename = "newgroup")]
    NewGroup {
        sid: SessionId,
        groups: Vec<GroupSummary>,
        count: usize,
    },
    #[serde(rename = "alreadyteacher")]
    AlreadyTeacher { sid: SessionId, message: String },
    #[serde(rename = "userdisconnected")]
    UserDisconnected {
        sid: SessionId,
        usersocketid: ConnectionId,
        count: usize,
    },
    #[serde(rename = "groupmemberdisconnected")]
    GroupMemberDisconnected {
        sid: SessionId,
        groupid: GroupId,
        count: usize,
    },
    #[serde(rename = "groupdisconnected")]
    GroupDisconnected {
        sid: SessionId,
        groupid: GroupId,
        count: usize,
    },
    #[serde(rename = "countusers")]
    CountUsers { sid: SessionId, count: usize },

    #[serde(rename = "question")]
    Question {
        sid: SessionId,
        #[serde(skip_serializing_if = "Option::is_none")]
        context: Option<OwnedValue>,
    },
    #[serde(rename = "pauseQuestion")]
    PauseQuestion {
        sid: SessionId,
        #[serde(flatten)]
        question: QuestionRef,
    },
    #[serde(rename = "playQuestion")]
    PlayQuestion {
        sid: SessionId,
        #[serde(flatten)]
        question: QuestionRef,
    },
    #[serde(rename = "showAnswers")]
    ShowAnswers {
        sid: SessionId,
        #[serde(flatten)]
        question: QuestionRef,
    },
    #[serde(rename = "hideAnswers")]
    HideAnswers {
        sid: SessionId,
        #[serde(flatten)]
        question: QuestionRef,
    },
    #[serde(rename = "showStatistics")]
    ShowStatistics {
        sid: SessionId,
        #[serde(flatten)]
        question: QuestionRef,
    },
    #[serde(rename = "hideStatistics")]
    HideStatistics {
        sid: SessionId,
        #[serde(flatten)]
        question: QuestionRef,
    },
    #[serde(rename = "showFeedback")]
    ShowFeedback {
        sid: SessionId,
        #[serde(flatten)]
        question: QuestionRef,
    },
    #[serde(rename = "hideFeedback")]
    HideFeedback {
        sid: SessionId,
        #[serde(flatten)]
        question: QuestionRef,
    },
    #[serde(rename = "teacherQuestionEnd")]
    TeacherQuestionEnd {
        sid: SessionId,
        #[serde(flatten)]
        question: QuestionRef,
        #[serde(skip_serializing_if = "Option::is_none")]
        statistics: Option<OwnedValue>,
    },

    #[serde(rename = "ranking")]
    Ranking {
        sid: SessionId,
        #[serde(skip_serializing_if = "Option::is_none")]
        context: Option<OwnedValue>,
    },
    #[serde(rename = "endSession")]
    EndSession {
        sid: SessionId,
        #[serde(skip_serializing_if = "Option::is_none")]
        context: Option<OwnedValue>,
    },

    #[serde(rename = "alreadyAnswered")]
    AlreadyAnswered {
        sid: SessionId,
        #[serde(skip_serializing_if = "Option::is_none")]
        userid: Option<UserId>,
        #[serde(flatten)]
        question: QuestionRef,
    },
    #[serde(rename = "normalizeUser")]
    NormalizeUser {
        sid: SessionId,
        #[serde(skip_serializing_if = "Option::is_none")]
        userid: Option<UserId>,
        #[serde(flatten)]
        question: QuestionRef,
    },

    #[serde(rename = "improvising")]
    Improvising {
        sid: SessionId,
        #[serde(flatten)]
        question: QuestionRef,
    },
    #[serde(rename = "closeImprovise")]
    CloseImprovise {
        sid: SessionId,
        #[serde(flatten)]
        question: QuestionRef,
    },
    #[serde(rename = "improvised")]
    Improvised {
        sid: SessionId,
        #[serde(flatten)]
        question: QuestionRef,
    },
    #[serde(rename = "initVote")]
    InitVote {
        sid: SessionId,
        #[serde(flatten)]
        question: QuestionRef,
    },
    #[serde(rename = "printNewTag")]
    PrintNewTag {
        sid: SessionId,
        #[serde(flatten)]
        question: QuestionRef,
        #[serde(skip_serializing_if = "Option::is_none")]
        tags: Option<OwnedValue>,
    },
    #[serde(rename = "ImproviseStudentTag")]
    ImproviseStudentTag {
        sid: SessionId,
        #[serde(skip_serializing_if = "Option::is_none")]
        userid: Option<UserId>,
        #[serde(flatten)]
        question: QuestionRef,
        #[serde(skip_serializing_if = "Option::is_none")]
        usertag: Option<OwnedValue>,
    },
    #[serde(rename = "StudentVotedTag")]
    StudentVotedTag {
        sid: SessionId,
        #[serde(skip_serializing_if = "Option::is_none")]
        userid: Option<UserId>,
        #[serde(flatten)]
        question: QuestionRef,
        #[serde(skip_serializing_if = "Option::is_none")]
        votedtag: Option<OwnedValue>,
    },

    /// Reply to `ping`.
    #[serde(rename = "connect")]
    Connect { sid: SessionId },
    #[serde(rename = "diag")]
    Diag {
        sid: SessionId,
        teacher: bool,
        students: usize,
        groups: usize,
        connections: usize,
    },
    #[serde(rename = "shutdownTest")]
    ShutdownTest { sid: SessionId },

    #[serde(rename = "error")]
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        sid: Option<SessionId>,
        message: String,
    },
}

impl Outbound {
    /// Wire name of the action, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Outbound::NewUser { .. } => "newuser",
            Outbound::NewGroup { .. } => "newgroup",
            Outbound::AlreadyTeacher { .. } => "alreadyteacher",
            Outbound::UserDisconnected { .. } => "userdisconnected",
            Outbound::GroupMemberDisconnected { .. } => "groupmemberdisconnected",
            Outbound::GroupDisconnected { .. } => "groupdisconnected",
            Outbound::CountUsers { .. } => "countusers",
            Outbound::Question { .. } => "question",
            Outbound::PauseQuestion { .. } => "pauseQuestion",
            Outbound::PlayQuestion { .. } => "playQuestion",
            Outbound::ShowAnswers { .. } => "showAnswers",
            Outbound::HideAnswers { .. } => "hideAnswers",
            Outbound::ShowStatistics { .. } => "showStatistics",
            Outbound::HideStatistics { .. } => "hideStatistics",
            Outbound::ShowFeedback { .. } => "showFeedback",
            Outbound::HideFeedback { .. } => "hideFeedback",
            Outbound::TeacherQuestionEnd { .. } => "teacherQuestionEnd",
            Outbound::Ranking { .. } => "ranking",
            Outbound::EndSession { .. } => "endSession",
            Outbound::AlreadyAnswered { .. } => "alreadyAnswered",
            Outbound::NormalizeUser { .. } => "normalizeUser",
            Outbound::Improvising { .. } => "improvising",
            Outbound::CloseImprovise { .. } => "closeImprovise",
            Outbound::Improvised { .. } => "improvised",
            Outbound::InitVote { .. } => "initVote",
            Outbound::PrintNewTag { .. } => "printNewTag",
            Outbound::ImproviseStudentTag { .. } => "ImproviseStudentTag",
            Outbound::StudentVotedTag { .. } => "StudentVotedTag",
            Outbound::Connect { .. } => "connect",
            Outbound::Diag { .. } => "diag",
            Outbound::ShutdownTest { .. } => "shutdownTest",
            Outbound::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> Result<String, simd_json::Error> {
        simd_json::serde::to_string(self)
    }
}
