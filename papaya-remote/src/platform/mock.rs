use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use papaya_util::types::BearerToken;

use super::{
    AssetKind, AssetNode, DeviceCredentials, EntityRef, EntityType, Platform, ProfileId, Relation,
};
use crate::error::{ApiError, TransportError};
use crate::location::{Coordinates, GeoPoint};

pub(crate) const USERNAME: &str = "tenant@example.com";
pub(crate) const PASSWORD: &str = "tenant";

#[derive(Default)]
struct State {
    valid_tokens: HashSet<String>,
    profiles: HashMap<(EntityType, String), ProfileId>,
    nodes: Vec<AssetNode>,
    locations: HashMap<String, GeoPoint>,
    relations: Vec<Relation>,
    credentials: HashMap<String, DeviceCredentials>,
    calls: Vec<&'static str>,
    fail_at: Option<(&'static str, usize)>,
    next_id: usize,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }
}

/// In-memory tenant implementing the management API
#[derive(Default)]
pub(crate) struct MockPlatform {
    state: Mutex<State>,
}

impl MockPlatform {
    /// A tenant with the Country, State and Parking Meter profiles and no
    /// nodes
    pub fn new() -> Self {
        let platform = Self::default();
        {
            let mut state = platform.lock();
            for (entity_type, name) in [
                (EntityType::Asset, "Country"),
                (EntityType::Asset, "State"),
                (EntityType::Device, "Parking Meter"),
            ] {
                let id = state.next_id("profile");
                state
                    .profiles
                    .insert((entity_type, name.to_lowercase()), ProfileId(id));
            }
        }
        platform
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Record a call, failing it if it was scheduled to fail or if `token`
    // is not a live session
    fn enter(
        &self,
        op: &'static str,
        token: Option<&BearerToken>,
    ) -> Result<MutexGuard<'_, State>, ApiError> {
        let mut state = self.lock();
        let seen = state.calls.iter().filter(|c| **c == op).count();
        state.calls.push(op);

        if state.fail_at == Some((op, seen)) {
            return Err(TransportError(format!("{op} timed out")).into());
        }
        if let Some(token) = token
            && !state.valid_tokens.contains(token.as_str())
        {
            return Err(ApiError::Unauthorized);
        }
        Ok(state)
    }

    /// Make the `nth` (0-based) call to `op` fail with a transport error
    pub fn fail_at(&self, op: &'static str, nth: usize) {
        let mut state = self.lock();
        let seen = state.calls.iter().filter(|c| **c == op).count();
        state.fail_at = Some((op, seen + nth));
    }

    /// Number of calls made to `op`
    pub fn calls(&self, op: &str) -> usize {
        self.lock().calls.iter().filter(|c| **c == op).count()
    }

    pub fn total_calls(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn issue_token(&self) -> BearerToken {
        let mut state = self.lock();
        let token = state.next_id("ey");
        state.valid_tokens.insert(token.clone());
        BearerToken::from(token)
    }

    pub fn revoke_tokens(&self) {
        self.lock().valid_tokens.clear();
    }

    pub fn nodes(&self, kind: AssetKind) -> Vec<AssetNode> {
        self.lock()
            .nodes
            .iter()
            .filter(|n| n.kind == kind)
            .cloned()
            .collect()
    }

    pub fn relations(&self) -> Vec<Relation> {
        self.lock().relations.clone()
    }

    pub fn location_of(&self, entity: &EntityRef) -> Option<GeoPoint> {
        self.lock().locations.get(&entity.id).copied()
    }

    /// Add a node as if created by an earlier run
    pub fn add_node(
        &self,
        kind: AssetKind,
        name: &str,
        profile: &str,
        location: Option<GeoPoint>,
    ) -> EntityRef {
        let mut state = self.lock();
        let id = EntityRef {
            entity_type: kind.entity_type(),
            id: state.next_id(kind.as_str()),
        };
        if let Some(point) = location {
            state.locations.insert(id.id.clone(), point);
        }
        if kind == AssetKind::Device {
            let token = state.next_id("token");
            state.credentials.insert(
                id.id.clone(),
                DeviceCredentials {
                    credentials_type: DeviceCredentials::ACCESS_TOKEN.to_owned(),
                    credentials_id: token,
                },
            );
        }
        state.nodes.push(AssetNode {
            id: id.clone(),
            name: name.to_owned(),
            profile: profile.to_owned(),
            kind,
            location: None,
        });
        id
    }

    pub fn add_relation(&self, from: &EntityRef, to: &EntityRef) {
        self.lock().relations.push(Relation {
            from: from.clone(),
            to: to.clone(),
        });
    }

    /// Replace (or with `None` remove) the credentials of a device
    pub fn set_credentials(&self, device: &EntityRef, credentials: Option<DeviceCredentials>) {
        let mut state = self.lock();
        match credentials {
            Some(c) => state.credentials.insert(device.id.clone(), c),
            None => state.credentials.remove(&device.id),
        };
    }
}

#[async_trait]
impl Platform for MockPlatform {
    async fn login(&self, username: &str, password: &str) -> Result<BearerToken, ApiError> {
        let mut state = self.enter("login", None)?;
        if username != USERNAME || password != PASSWORD {
            return Err(ApiError::Unauthorized);
        }
        let token = state.next_id("ey");
        state.valid_tokens.insert(token.clone());
        Ok(BearerToken::from(token))
    }

    async fn probe(&self, token: &BearerToken) -> Result<(), ApiError> {
        self.enter("probe", Some(token))?;
        Ok(())
    }

    async fn find_profile(
        &self,
        token: &BearerToken,
        kind: AssetKind,
        name: &str,
    ) -> Result<Option<ProfileId>, ApiError> {
        let state = self.enter("find_profile", Some(token))?;
        Ok(state
            .profiles
            .get(&(kind.entity_type(), name.to_lowercase()))
            .cloned())
    }

    async fn find_nodes(
        &self,
        token: &BearerToken,
        kind: AssetKind,
        name: &str,
        profile: &str,
    ) -> Result<Vec<AssetNode>, ApiError> {
        let state = self.enter("find_nodes", Some(token))?;
        Ok(state
            .nodes
            .iter()
            .filter(|n| n.kind.entity_type() == kind.entity_type())
            .filter(|n| n.name.eq_ignore_ascii_case(name))
            .filter(|n| kind == AssetKind::Device || n.profile.eq_ignore_ascii_case(profile))
            .map(|n| AssetNode { kind, ..n.clone() })
            .collect())
    }

    async fn create_node(
        &self,
        token: &BearerToken,
        kind: AssetKind,
        name: &str,
        profile: &str,
        _profile_id: &ProfileId,
    ) -> Result<AssetNode, ApiError> {
        drop(self.enter("create_node", Some(token))?);
        let id = self.add_node(kind, name, profile, None);
        Ok(AssetNode {
            id,
            name: name.to_owned(),
            profile: profile.to_owned(),
            kind,
            location: None,
        })
    }

    async fn read_location(
        &self,
        token: &BearerToken,
        entity: &EntityRef,
    ) -> Result<Option<GeoPoint>, ApiError> {
        let state = self.enter("read_location", Some(token))?;
        Ok(state.locations.get(&entity.id).copied())
    }

    async fn save_location(
        &self,
        token: &BearerToken,
        entity: &EntityRef,
        coordinates: &Coordinates,
    ) -> Result<(), ApiError> {
        let mut state = self.enter("save_location", Some(token))?;
        state
            .locations
            .insert(entity.id.clone(), coordinates.point());
        Ok(())
    }

    async fn find_relation(
        &self,
        token: &BearerToken,
        from: &EntityRef,
        to: &EntityRef,
    ) -> Result<Option<Relation>, ApiError> {
        let state = self.enter("find_relation", Some(token))?;
        Ok(state
            .relations
            .iter()
            .find(|r| &r.from == from && &r.to == to)
            .cloned())
    }

    async fn relations_to(
        &self,
        token: &BearerToken,
        to: &EntityRef,
    ) -> Result<Vec<Relation>, ApiError> {
        let state = self.enter("relations_to", Some(token))?;
        Ok(state
            .relations
            .iter()
            .filter(|r| &r.to == to)
            .cloned()
            .collect())
    }

    async fn create_relation(
        &self,
        token: &BearerToken,
        relation: &Relation,
    ) -> Result<(), ApiError> {
        let mut state = self.enter("create_relation", Some(token))?;
        state.relations.push(relation.clone());
        Ok(())
    }

    async fn delete_relation(
        &self,
        token: &BearerToken,
        relation: &Relation,
    ) -> Result<(), ApiError> {
        let mut state = self.enter("delete_relation", Some(token))?;
        state.relations.retain(|r| r != relation);
        Ok(())
    }

    async fn device_credentials(
        &self,
        token: &BearerToken,
        device: &EntityRef,
    ) -> Result<Option<DeviceCredentials>, ApiError> {
        let state = self.enter("device_credentials", Some(token))?;
        Ok(state.credentials.get(&device.id).cloned())
    }
}
