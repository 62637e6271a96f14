use std::collections::{BTreeMap, HashMap};

use log::{debug, info, warn};
use simd_json::OwnedValue;

use crate::protocol::{
    ConnectionId, GroupId, GroupIdentity, GroupSummary, Identity, Outbound, Scope, SessionId,
    StudentSummary, UserId,
};

/// I/O the event loop performs on behalf of the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send { to: ConnectionId, message: Outbound },
    Disconnect(ConnectionId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Connected but not yet identified.
    Unassigned,
    Teacher,
    Student,
    GroupMember(GroupId),
}

/// Identity of a registered connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    pub role: Role,
    pub sid: SessionId,
    pub userid: UserId,
    pub name: String,
    pub pic: String,
    pub cmid: Option<OwnedValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub teacher: bool,
    pub students: usize,
    pub groups: usize,
}

#[derive(Debug)]
struct Group {
    name: String,
    picture: String,
    /// Keyed by user, so a user leaving removes exactly one membership.
    members: BTreeMap<UserId, ConnectionId>,
}

/// Exists only while it has at least one member.
#[derive(Debug, Default)]
struct Session {
    teacher: Option<ConnectionId>,
    students: BTreeMap<UserId, ConnectionId>,
    groups: BTreeMap<GroupId, Group>,
}

impl Session {
    fn members(&self) -> Vec<ConnectionId> {
        let mut members: Vec<ConnectionId> = self.teacher.into_iter().collect();
        members.extend(self.students.values().copied());
        for group in self.groups.values() {
            members.extend(group.members.values().copied());
        }
        members
    }

    fn is_empty(&self) -> bool {
        self.teacher.is_none() && self.students.is_empty() && self.groups.is_empty()
    }

    fn contains(&self, id: ConnectionId) -> bool {
        self.teacher == Some(id)
            || self.students.values().any(|&c| c == id)
            || self
                .groups
                .values()
                .any(|g| g.members.values().any(|&c| c == id))
    }
}

/// Session membership for every identified connection.
///
/// Holds no sockets: each mutation returns the [`Effect`]s it implies.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
    peers: HashMap<ConnectionId, Peer>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `id` as the teacher of `sid`. A second teacher is answered with
    /// `alreadyteacher` and dropped; the registry stays as it was.
    pub fn register_teacher(
        &mut self,
        id: ConnectionId,
        sid: SessionId,
        identity: &Identity,
    ) -> Vec<Effect> {
        if let Some(existing) = self.sessions.get(&sid).and_then(|s| s.teacher) {
            if existing != id {
                warn!("session {sid}: rejecting second teacher {id}, {existing} holds the seat");
                return vec![
                    Effect::Send {
                        to: id,
                        message: Outbound::AlreadyTeacher {
                            sid,
                            message: "this session already has a teacher".to_string(),
                        },
                    },
                    Effect::Disconnect(id),
                ];
            }
        }

        let mut effects = self.release(id, &sid, &Role::Teacher);
        self.peers.insert(
            id,
            Peer {
                role: Role::Teacher,
                sid: sid.clone(),
                userid: identity.userid.clone(),
                name: identity.name.clone(),
                pic: identity.pic.clone(),
                cmid: identity.cmid.clone(),
            },
        );
        self.sessions.entry(sid.clone()).or_default().teacher = Some(id);
        info!("session {sid}: teacher {} joined as {id}", identity.userid);

        effects.extend(self.roster_notice(&sid));
        effects
    }

    /// Binds `id` as a student of `sid`. An older connection of the same user
    /// is dropped without notice.
    pub fn register_student(
        &mut self,
        id: ConnectionId,
        sid: SessionId,
        identity: &Identity,
    ) -> Vec<Effect> {
        let mut effects = self.release(id, &sid, &Role::Student);

        let session = self.sessions.entry(sid.clone()).or_default();
        if let Some(previous) = session.students.insert(identity.userid.clone(), id) {
            if previous != id {
                info!(
                    "session {sid}: user {} reconnected as {id}, evicting {previous}",
                    identity.userid
                );
                self.peers.remove(&previous);
                effects.push(Effect::Disconnect(previous));
            }
        }
        self.peers.insert(
            id,
            Peer {
                role: Role::Student,
                sid: sid.clone(),
                userid: identity.userid.clone(),
                name: identity.name.clone(),
                pic: identity.pic.clone(),
                cmid: identity.cmid.clone(),
            },
        );
        debug!("session {sid}: student {} joined as {id}", identity.userid);

        effects.extend(self.roster_notice(&sid));
        effects
    }

    /// Adds `id` to a group of `sid`, creating the group on its first member.
    pub fn register_group_member(
        &mut self,
        id: ConnectionId,
        sid: SessionId,
        identity: &GroupIdentity,
    ) -> Vec<Effect> {
        let role = Role::GroupMember(identity.groupid.clone());
        let mut effects = self.release(id, &sid, &role);

        let session = self.sessions.entry(sid.clone()).or_default();
        let group = session
            .groups
            .entry(identity.groupid.clone())
            .or_insert_with(|| Group {
                name: identity.groupname.clone(),
                picture: identity.grouppic.clone(),
                members: BTreeMap::new(),
            });
        if let Some(previous) = group.members.insert(identity.userid.clone(), id) {
            if previous != id {
                info!(
                    "session {sid}: group member {} reconnected as {id}, evicting {previous}",
                    identity.userid
                );
                self.peers.remove(&previous);
                effects.push(Effect::Disconnect(previous));
            }
        }
        self.peers.insert(
            id,
            Peer {
                role,
                sid: sid.clone(),
                userid: identity.userid.clone(),
                name: identity.name.clone(),
                pic: identity.pic.clone(),
                cmid: identity.cmid.clone(),
            },
        );
        debug!(
            "session {sid}: {} joined group {} as {id}",
            identity.userid, identity.groupid
        );

        effects.extend(self.group_notice(&sid));
        effects
    }

    /// Forgets `id` and tells the rest of its session. A departing teacher
    /// takes the whole session down with them.
    pub fn on_disconnect(&mut self, id: ConnectionId) -> Vec<Effect> {
        let Some(peer) = self.peers.remove(&id) else {
            return Vec::new();
        };
        let sid = peer.sid;
        let Some(session) = self.sessions.get_mut(&sid) else {
            return Vec::new();
        };

        let mut notices = Vec::new();
        match peer.role {
            Role::Teacher => {
                if session.teacher == Some(id) {
                    session.teacher = None;
                    let remaining = session.members();
                    info!(
                        "session {sid}: teacher {id} left, closing {} remaining connection(s)",
                        remaining.len()
                    );
                    self.sessions.remove(&sid);
                    let mut effects = Vec::with_capacity(remaining.len());
                    for other in remaining {
                        self.peers.remove(&other);
                        effects.push(Effect::Disconnect(other));
                    }
                    return effects;
                }
            }
            Role::Student => {
                if session.students.get(&peer.userid) == Some(&id) {
                    session.students.remove(&peer.userid);
                }
            }
            Role::GroupMember(groupid) => {
                if let Some(group) = session.groups.get_mut(&groupid) {
                    if group.members.get(&peer.userid) == Some(&id) {
                        group.members.remove(&peer.userid);
                    }
                    if group.members.is_empty() {
                        session.groups.remove(&groupid);
                        notices.push(Outbound::GroupDisconnected {
                            sid: sid.clone(),
                            groupid,
                            count: session.groups.len(),
                        });
                    } else {
                        notices.push(Outbound::GroupMemberDisconnected {
                            sid: sid.clone(),
                            count: group.members.len(),
                            groupid,
                        });
                    }
                }
            }
            Role::Unassigned => {}
        }

        notices.push(Outbound::UserDisconnected {
            sid: sid.clone(),
            usersocketid: id,
            count: session.students.len(),
        });

        let recipients = session.members();
        if session.is_empty() {
            debug!("session {sid}: last member left");
            self.sessions.remove(&sid);
        }
        fan_out(&recipients, notices)
    }

    /// Group of `userid` within `sid`, if any.
    pub fn resolve_group_of(&self, sid: &SessionId, userid: &UserId) -> Option<GroupId> {
        let session = self.sessions.get(sid)?;
        session
            .groups
            .iter()
            .find(|(_, group)| group.members.contains_key(userid))
            .map(|(groupid, _)| groupid.clone())
    }

    /// Connections a message from `sender` reaches under `scope`. The sender
    /// never receives its own message.
    pub fn targets(&self, sid: &SessionId, scope: &Scope, sender: ConnectionId) -> Vec<ConnectionId> {
        let Some(session) = self.sessions.get(sid) else {
            return Vec::new();
        };
        let targets = match scope {
            Scope::All => session.members(),
            Scope::TeacherOnly => session.teacher.into_iter().collect(),
            Scope::StudentOnly(id) => {
                if session.teacher != Some(*id) && session.contains(*id) {
                    vec![*id]
                } else {
                    Vec::new()
                }
            }
            Scope::GroupOnly(groupid) => session
                .groups
                .get(groupid)
                .map(|g| g.members.values().copied().collect())
                .unwrap_or_default(),
        };
        targets.into_iter().filter(|&id| id != sender).collect()
    }

    pub fn peer(&self, id: ConnectionId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn role_of(&self, id: ConnectionId) -> Role {
        self.peers
            .get(&id)
            .map_or(Role::Unassigned, |peer| peer.role.clone())
    }

    pub fn teacher_of(&self, sid: &SessionId) -> Option<ConnectionId> {
        self.sessions.get(sid).and_then(|s| s.teacher)
    }

    pub fn student_count(&self, sid: &SessionId) -> usize {
        self.sessions.get(sid).map_or(0, |s| s.students.len())
    }

    pub fn group_count(&self, sid: &SessionId) -> usize {
        self.sessions.get(sid).map_or(0, |s| s.groups.len())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn snapshot(&self, sid: &SessionId) -> SessionSnapshot {
        SessionSnapshot {
            teacher: self.teacher_of(sid).is_some(),
            students: self.student_count(sid),
            groups: self.group_count(sid),
        }
    }

    /// Drops an earlier registration of `id` unless it already holds `role`
    /// in `sid`.
    fn release(&mut self, id: ConnectionId, sid: &SessionId, role: &Role) -> Vec<Effect> {
        let unchanged = match self.peers.get(&id) {
            Some(peer) => peer.sid == *sid && peer.role == *role,
            None => true,
        };
        if unchanged {
            Vec::new()
        } else {
            self.on_disconnect(id)
        }
    }

    fn roster_notice(&self, sid: &SessionId) -> Vec<Effect> {
        let Some(session) = self.sessions.get(sid) else {
            return Vec::new();
        };
        let students: Vec<StudentSummary> = session
            .students
            .iter()
            .filter_map(|(userid, &conn)| {
                let peer = self.peers.get(&conn)?;
                Some(StudentSummary {
                    userid: userid.clone(),
                    name: peer.name.clone(),
                    picture: peer.pic.clone(),
                    usersocketid: conn,
                })
            })
            .collect();
        let notice = Outbound::NewUser {
            sid: sid.clone(),
            count: students.len(),
            students,
        };
        fan_out(&session.members(), vec![notice])
    }

    fn group_notice(&self, sid: &SessionId) -> Vec<Effect> {
        let Some(session) = self.sessions.get(sid) else {
            return Vec::new();
        };
        let groups: Vec<GroupSummary> = session
            .groups
            .iter()
            .map(|(groupid, group)| GroupSummary {
                groupid: groupid.clone(),
                name: group.name.clone(),
                picture: group.picture.clone(),
                numusers: group.members.len(),
            })
            .collect();
        let notice = Outbound::NewGroup {
            sid: sid.clone(),
            count: groups.len(),
            groups,
        };
        fan_out(&session.members(), vec![notice])
    }
}

fn fan_out(recipients: &[ConnectionId], messages: Vec<Outbound>) -> Vec<Effect> {
    let mut effects = Vec::with_capacity(recipients.len() * messages.len());
    for message in messages {
        for &to in recipients {
            effects.push(Effect::Send {
                to,
                message: message.clone(),
            });
        }
    }
    effects
}
