//! Cluster membership: servers, roles, groups and the joint-consensus phase.

use std::collections::BTreeSet;
use std::io::Cursor;
use std::io::Read;

use byteorder::LittleEndian;
use byteorder::ReadBytesExt;
use byteorder::WriteBytesExt;
use serde::Deserialize;
use serde::Serialize;

use crate::error::MembershipError;
use crate::MessageSummary;
use crate::NodeId;

/// The version byte of the configuration blob codec.
const ENCODING_VERSION: u8 = 1;
/// The size of the meta block in the extended form of the blob.
const META_BLOCK_SIZE: usize = 256;
/// The size of one extended server record: id + role + role_new + group.
const EXTENDED_RECORD_SIZE: usize = 11;

/// The role a server plays in the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerRole {
    /// Receives log entries and counts towards quorum, both for elections and for commit.
    Voter,
    /// Receives log entries but has no vote; a warm spare for promotion.
    Standby,
    /// Receives nothing until promoted; takes no part in the protocol.
    Spare,
    /// Receives log entries for durability only; never votes and is never promoted by quorum.
    Logger,
}

impl ServerRole {
    /// Check whether servers in this role receive replicated log entries.
    pub fn receives_log(&self) -> bool {
        matches!(self, ServerRole::Voter | ServerRole::Standby | ServerRole::Logger)
    }

    fn to_code(self) -> u8 {
        match self {
            ServerRole::Standby => 0,
            ServerRole::Voter => 1,
            ServerRole::Spare => 2,
            ServerRole::Logger => 3,
        }
    }

    fn from_code(code: u8) -> Result<Self, MembershipError> {
        match code {
            0 => Ok(ServerRole::Standby),
            1 => Ok(ServerRole::Voter),
            2 => Ok(ServerRole::Spare),
            3 => Ok(ServerRole::Logger),
            other => Err(MembershipError::BadRole(other)),
        }
    }
}

/// The configuration group(s) a server belongs to, as a bitmask.
///
/// Outside of joint consensus every server is in the `OLD` group. During a joint configuration
/// change a server may belong to the outgoing group, the incoming group, or both.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group(u8);

impl Group {
    pub const OLD: Group = Group(0b01);
    pub const NEW: Group = Group(0b10);
    pub const BOTH: Group = Group(0b11);

    /// Check if all of `other`'s bits are set in `self`.
    pub fn contains(self, other: Group) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check if any of `other`'s bits are set in `self`.
    pub fn intersects(self, other: Group) -> bool {
        self.0 & other.0 != 0
    }

    fn to_code(self) -> u8 {
        self.0
    }

    fn from_code(code: u8) -> Result<Self, MembershipError> {
        if code == 0 || code > 0b11 {
            return Err(MembershipError::Malformed);
        }
        Ok(Group(code))
    }
}

/// A single server of the cluster configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// The server's id; unique within a configuration and never 0.
    pub id: NodeId,
    /// The server's role as seen by the outgoing (`OLD`) configuration.
    pub role: ServerRole,
    /// The server's role as seen by the incoming (`NEW`) configuration.
    ///
    /// Equal to `role` outside of joint consensus.
    pub role_new: ServerRole,
    /// The group(s) this server belongs to.
    pub group: Group,
}

impl Server {
    /// Create a server in the `OLD` group with the same role in both views.
    pub fn new(id: NodeId, role: ServerRole) -> Self {
        Server {
            id,
            role,
            role_new: role,
            group: Group::OLD,
        }
    }

    /// The role this server plays in the given group's view of the configuration.
    pub fn role_in(&self, group: Group) -> ServerRole {
        if group.contains(Group::NEW) {
            self.role_new
        } else {
            self.role
        }
    }

    /// Check if this server is a voting member of the given group.
    pub fn is_voter_in(&self, group: Group) -> bool {
        self.group.intersects(group) && self.role_in(group) == ServerRole::Voter
    }

    /// Check if this server should receive replicated entries from the leader.
    pub fn receives_log(&self) -> bool {
        (self.group.intersects(Group::OLD) && self.role.receives_log())
            || (self.group.intersects(Group::NEW) && self.role_new.receives_log())
    }
}

/// The phase of a configuration: a settled one, or one mid-way through a joint change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipPhase {
    Normal,
    Joint,
}

/// The membership configuration of the cluster.
///
/// A configuration is an ordered, flat array of servers; `n` is small (typically at most 9) and
/// lookups dominate mutations, so every search is a linear scan. During joint consensus the
/// configuration holds the union of the outgoing and incoming groups and quorum decisions
/// require a majority in each.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    servers: Vec<Server>,
    phase: MembershipPhase,
}

impl Default for Membership {
    fn default() -> Self {
        Membership::empty()
    }
}

impl MessageSummary for Membership {
    fn summary(&self) -> String {
        let servers = self
            .servers
            .iter()
            .map(|s| format!("{}:{:?}/{:?}", s.id, s.role, s.role_new))
            .collect::<Vec<_>>()
            .join(",");
        format!("{{phase:{:?} [{}]}}", self.phase, servers)
    }
}

impl Membership {
    /// Create an empty configuration.
    pub fn empty() -> Self {
        Membership {
            servers: Vec::new(),
            phase: MembershipPhase::Normal,
        }
    }

    /// Create a new initial config containing only the given node ID as a voter.
    pub fn new_initial(id: NodeId) -> Self {
        Membership {
            servers: vec![Server::new(id, ServerRole::Voter)],
            phase: MembershipPhase::Normal,
        }
    }

    /// Create a Normal-phase configuration in which every given node is a voter.
    pub fn new_voters(ids: impl IntoIterator<Item = NodeId>) -> Result<Self, MembershipError> {
        let mut membership = Membership::empty();
        for id in ids {
            membership.add(Server::new(id, ServerRole::Voter))?;
        }
        Ok(membership)
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    pub fn phase(&self) -> MembershipPhase {
        self.phase
    }

    /// Check to see if the config is currently in joint consensus.
    pub fn is_joint(&self) -> bool {
        self.phase == MembershipPhase::Joint
    }

    /// Append a server to the configuration.
    ///
    /// No ordering is guaranteed; lookups are linear scans.
    pub fn add(&mut self, server: Server) -> Result<(), MembershipError> {
        if server.id == 0 {
            return Err(MembershipError::BadId);
        }
        if self.contains(&server.id) {
            return Err(MembershipError::DuplicateId(server.id));
        }
        self.servers.push(server);
        Ok(())
    }

    /// Delete the server with the given id, preserving the relative order of the survivors.
    pub fn remove(&mut self, id: NodeId) -> Result<(), MembershipError> {
        match self.index_of(&id) {
            Some(idx) => {
                self.servers.remove(idx);
                Ok(())
            }
            None => Err(MembershipError::BadId),
        }
    }

    /// Find the position of the server with the given id.
    pub fn index_of(&self, id: &NodeId) -> Option<usize> {
        self.servers.iter().position(|s| &s.id == id)
    }

    /// Get the server with the given id.
    pub fn server(&self, id: &NodeId) -> Option<&Server> {
        self.servers.iter().find(|s| &s.id == id)
    }

    /// Get a mutable handle to the server with the given id.
    pub fn server_mut(&mut self, id: &NodeId) -> Option<&mut Server> {
        self.servers.iter_mut().find(|s| &s.id == id)
    }

    /// Check if the given NodeId exists in this membership config.
    ///
    /// When in joint consensus, this will check both config groups.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.index_of(id).is_some()
    }

    /// Count the servers which project to a voter in the requested group.
    ///
    /// `Group::BOTH` counts servers which are a voter in either group.
    pub fn voter_count(&self, group: Group) -> usize {
        match group {
            Group::BOTH => self.servers.iter().filter(|s| s.is_voter_in(Group::OLD) || s.is_voter_in(Group::NEW)).count(),
            g => self.servers.iter().filter(|s| s.is_voter_in(g)).count(),
        }
    }

    /// Iterate the ids of the voting members of the given group.
    pub fn voter_ids(&self, group: Group) -> impl Iterator<Item = NodeId> + '_ {
        self.servers.iter().filter(move |s| s.is_voter_in(group)).map(|s| s.id)
    }

    /// Check if the given node is a voter in any active group.
    pub fn is_voter(&self, id: &NodeId) -> bool {
        self.server(id).map(|s| s.is_voter_in(Group::OLD) || s.is_voter_in(Group::NEW)).unwrap_or(false)
    }

    /// Get the set of all node ids in the configuration.
    pub fn all_nodes(&self) -> BTreeSet<NodeId> {
        self.servers.iter().map(|s| s.id).collect()
    }

    /// Iterate the ids of the servers which receive replicated entries from the leader.
    pub fn replication_targets(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.servers.iter().filter(|s| s.receives_log()).map(|s| s.id)
    }

    /// Produce a Normal-phase copy containing only the servers whose group includes `keep`,
    /// with each survivor's role taken from the kept group's view.
    pub fn joint_to_normal(&self, keep: Group) -> Membership {
        let servers = self
            .servers
            .iter()
            .filter(|s| s.group.intersects(keep))
            .map(|s| Server::new(s.id, s.role_in(keep)))
            .collect();
        Membership {
            servers,
            phase: MembershipPhase::Normal,
        }
    }

    /// Build the Joint-phase configuration for a combined promotion and removal.
    ///
    /// The outgoing group is this configuration; the incoming group is this configuration with
    /// `promote` assigned `role` and `remove` (when given) excluded.
    pub fn to_joint(
        &self,
        promote: NodeId,
        role: ServerRole,
        remove: Option<NodeId>,
    ) -> Result<Membership, MembershipError> {
        if !self.contains(&promote) {
            return Err(MembershipError::BadId);
        }
        if let Some(removed) = remove {
            if !self.contains(&removed) {
                return Err(MembershipError::BadId);
            }
        }
        let servers = self
            .servers
            .iter()
            .map(|s| {
                if Some(s.id) == remove {
                    // Removed servers only exist in the outgoing group.
                    Server {
                        group: Group::OLD,
                        ..*s
                    }
                } else {
                    Server {
                        role_new: if s.id == promote { role } else { s.role },
                        group: Group::BOTH,
                        ..*s
                    }
                }
            })
            .collect();
        Ok(Membership {
            servers,
            phase: MembershipPhase::Joint,
        })
    }

    /// Encode the configuration into the on-disk blob format.
    ///
    /// ```text
    /// u8  version = 1
    /// u64 n_servers                 (little-endian, unaligned)
    /// n × { u64 id; u8 role }
    /// meta block, 256 bytes:
    ///   u32 meta_version = 1; u32 server_version = 1; u32 server_size = 11;
    ///   u8 phase; u8 reserved[243]
    /// n × { u64 id; u8 role; u8 role_new; u8 group }
    /// zero padding to a multiple of 8 bytes
    /// ```
    ///
    /// The leading records carry only the `OLD`-view role so that decoders of the legacy format
    /// still see a usable configuration.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        // Writing into a Vec can not fail; the io::Result is structural.
        let _ = buf.write_u8(ENCODING_VERSION);
        let _ = buf.write_u64::<LittleEndian>(self.servers.len() as u64);
        for server in &self.servers {
            let _ = buf.write_u64::<LittleEndian>(server.id);
            let _ = buf.write_u8(server.role.to_code());
        }
        let _ = buf.write_u32::<LittleEndian>(1); // meta_version
        let _ = buf.write_u32::<LittleEndian>(1); // server_version
        let _ = buf.write_u32::<LittleEndian>(EXTENDED_RECORD_SIZE as u32);
        let _ = buf.write_u8(match self.phase {
            MembershipPhase::Normal => 0,
            MembershipPhase::Joint => 1,
        });
        buf.resize(buf.len() + 243, 0); // reserved
        for server in &self.servers {
            let _ = buf.write_u64::<LittleEndian>(server.id);
            let _ = buf.write_u8(server.role.to_code());
            let _ = buf.write_u8(server.role_new.to_code());
            let _ = buf.write_u8(server.group.to_code());
        }
        while buf.len() % 8 != 0 {
            buf.push(0);
        }
    }

    /// Decode a configuration blob.
    ///
    /// The legacy form, without the meta block and the extended records, is accepted by
    /// defaulting `role_new = role`, `group = OLD` and `phase = Normal`.
    pub fn decode(buf: &[u8]) -> Result<Membership, MembershipError> {
        let mut cur = Cursor::new(buf);
        let version = cur.read_u8().map_err(|_| MembershipError::Malformed)?;
        if version != ENCODING_VERSION {
            return Err(MembershipError::Malformed);
        }
        let n = cur.read_u64::<LittleEndian>().map_err(|_| MembershipError::Malformed)? as usize;

        let mut membership = Membership::empty();
        for _ in 0..n {
            let id = cur.read_u64::<LittleEndian>().map_err(|_| MembershipError::Malformed)?;
            let role = ServerRole::from_code(cur.read_u8().map_err(|_| MembershipError::Malformed)?)?;
            membership.add(Server::new(id, role))?;
        }

        // The meta block and the extended records are optional; without them this is a legacy
        // blob and the defaults set above already apply.
        let remaining = buf.len() as u64 - cur.position();
        if (remaining as usize) < META_BLOCK_SIZE + n * EXTENDED_RECORD_SIZE {
            return Ok(membership);
        }

        let meta_version = cur.read_u32::<LittleEndian>().map_err(|_| MembershipError::Malformed)?;
        let server_version = cur.read_u32::<LittleEndian>().map_err(|_| MembershipError::Malformed)?;
        let server_size = cur.read_u32::<LittleEndian>().map_err(|_| MembershipError::Malformed)?;
        if meta_version != 1 || server_version != 1 || server_size != EXTENDED_RECORD_SIZE as u32 {
            return Err(MembershipError::Malformed);
        }
        membership.phase = match cur.read_u8().map_err(|_| MembershipError::Malformed)? {
            0 => MembershipPhase::Normal,
            1 => MembershipPhase::Joint,
            _ => return Err(MembershipError::Malformed),
        };
        let mut reserved = [0u8; 243];
        cur.read_exact(&mut reserved).map_err(|_| MembershipError::Malformed)?;

        for i in 0..n {
            let id = cur.read_u64::<LittleEndian>().map_err(|_| MembershipError::Malformed)?;
            if membership.servers[i].id != id {
                return Err(MembershipError::Malformed);
            }
            let role = ServerRole::from_code(cur.read_u8().map_err(|_| MembershipError::Malformed)?)?;
            let role_new = ServerRole::from_code(cur.read_u8().map_err(|_| MembershipError::Malformed)?)?;
            let group = Group::from_code(cur.read_u8().map_err(|_| MembershipError::Malformed)?)?;
            let server = &mut membership.servers[i];
            server.role = role;
            server.role_new = role_new;
            server.group = group;
        }

        Ok(membership)
    }
}

/// A membership configuration along with the index of the log entry which proposed it.
///
/// Tracking the index lets a follower roll the configuration back when a conflicting leader
/// truncates the entry away before it ever committed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveMembership {
    /// The index of the log entry which carried this configuration, 0 for the initial one.
    pub log_index: u64,
    pub membership: Membership,
}

impl EffectiveMembership {
    pub fn new(log_index: u64, membership: Membership) -> Self {
        Self { log_index, membership }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_voters() -> Membership {
        Membership::new_voters(vec![1, 2, 3]).expect("valid ids")
    }

    #[test]
    fn test_add_rejects_duplicates_and_zero() {
        let mut m = three_voters();
        assert_eq!(m.add(Server::new(2, ServerRole::Standby)), Err(MembershipError::DuplicateId(2)));
        assert_eq!(m.add(Server::new(0, ServerRole::Voter)), Err(MembershipError::BadId));
        m.add(Server::new(4, ServerRole::Standby)).expect("new id");
        assert_eq!(m.servers().len(), 4);
    }

    #[test]
    fn test_remove_preserves_order() {
        let mut m = three_voters();
        m.remove(2).expect("member");
        let ids: Vec<_> = m.servers().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(m.remove(2), Err(MembershipError::BadId));
    }

    #[test]
    fn test_voter_count_per_group() {
        let mut m = three_voters();
        m.add(Server::new(4, ServerRole::Standby)).expect("new id");
        m.add(Server::new(5, ServerRole::Logger)).expect("new id");
        assert_eq!(m.voter_count(Group::OLD), 3);
        assert_eq!(m.voter_count(Group::NEW), 0);
        assert_eq!(m.voter_count(Group::BOTH), 3);

        let joint = m.to_joint(4, ServerRole::Voter, Some(3)).expect("valid joint");
        assert!(joint.is_joint());
        assert_eq!(joint.voter_count(Group::OLD), 3);
        assert_eq!(joint.voter_count(Group::NEW), 3);
        let new_voters: Vec<_> = joint.voter_ids(Group::NEW).collect();
        assert_eq!(new_voters, vec![1, 2, 4]);
    }

    #[test]
    fn test_joint_to_normal_keeps_new_view() {
        let m = three_voters();
        let joint = m.to_joint(2, ServerRole::Logger, Some(1)).expect("valid joint");
        let normal = joint.joint_to_normal(Group::NEW);
        assert_eq!(normal.phase(), MembershipPhase::Normal);
        let ids: Vec<_> = normal.servers().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![2, 3]);
        let s2 = normal.server(&2).expect("kept");
        assert_eq!(s2.role, ServerRole::Logger);
        assert_eq!(s2.role_new, ServerRole::Logger);
        assert_eq!(s2.group, Group::OLD);
    }

    #[test]
    fn test_encode_decode_round_trip_normal() {
        let mut m = three_voters();
        m.add(Server::new(9, ServerRole::Standby)).expect("new id");
        let mut buf = Vec::new();
        m.encode(&mut buf);
        assert_eq!(buf.len() % 8, 0);
        let decoded = Membership::decode(&buf).expect("valid blob");
        assert_eq!(decoded, m);
    }

    #[test]
    fn test_encode_decode_round_trip_joint() {
        let m = three_voters().to_joint(3, ServerRole::Voter, Some(1)).expect("valid joint");
        let mut buf = Vec::new();
        m.encode(&mut buf);
        let decoded = Membership::decode(&buf).expect("valid blob");
        assert_eq!(decoded.phase(), MembershipPhase::Joint);
        assert_eq!(decoded, m);
    }

    #[test]
    fn test_decode_legacy_blob() {
        // Version byte, n=2, then only the legacy {id, role} records plus padding.
        let mut buf = vec![1u8];
        let _ = buf.write_u64::<LittleEndian>(2);
        let _ = buf.write_u64::<LittleEndian>(7);
        let _ = buf.write_u8(1); // Voter
        let _ = buf.write_u64::<LittleEndian>(8);
        let _ = buf.write_u8(0); // Standby
        while buf.len() % 8 != 0 {
            buf.push(0);
        }

        let decoded = Membership::decode(&buf).expect("legacy blob");
        assert_eq!(decoded.phase(), MembershipPhase::Normal);
        let s7 = decoded.server(&7).expect("decoded");
        assert_eq!(s7.role, ServerRole::Voter);
        assert_eq!(s7.role_new, ServerRole::Voter);
        assert_eq!(s7.group, Group::OLD);
        let s8 = decoded.server(&8).expect("decoded");
        assert_eq!(s8.role, ServerRole::Standby);
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        let mut buf = vec![2u8];
        let _ = buf.write_u64::<LittleEndian>(0);
        assert_eq!(Membership::decode(&buf), Err(MembershipError::Malformed));
    }

    #[test]
    fn test_decode_rejects_unknown_role() {
        let mut buf = vec![1u8];
        let _ = buf.write_u64::<LittleEndian>(1);
        let _ = buf.write_u64::<LittleEndian>(7);
        let _ = buf.write_u8(9);
        assert_eq!(Membership::decode(&buf), Err(MembershipError::BadRole(9)));
    }
}
