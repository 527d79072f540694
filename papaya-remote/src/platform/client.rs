use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{Span, debug, field, instrument, trace};

use papaya_util::http::{Client, Method, Response, Uri};
use papaya_util::types::BearerToken;

use super::{
    AssetKind, AssetNode, DeviceCredentials, EntityRef, EntityType, Platform, ProfileId, Relation,
};
use crate::error::ApiError;
use crate::location::{Coordinates, GeoPoint};

const PAGE_SIZE: usize = 100;

#[derive(Deserialize)]
struct Page<T> {
    data: Vec<T>,
    #[serde(rename = "hasNext", default)]
    has_next: bool,
}

#[derive(Deserialize)]
struct IdField {
    id: String,
}

#[derive(Deserialize)]
struct ProfileEntry {
    id: IdField,
    name: String,
}

#[derive(Deserialize)]
struct NodeEntry {
    id: EntityRef,
    name: String,
    #[serde(rename = "type")]
    profile: String,
}

#[derive(Deserialize)]
struct RelationEntry {
    from: EntityRef,
    to: EntityRef,
    #[serde(rename = "type")]
    relation_type: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialsEntry {
    credentials_type: String,
    #[serde(default)]
    credentials_id: Option<String>,
}

#[derive(Deserialize)]
struct AttributeEntry {
    key: String,
    value: Value,
}

#[derive(Deserialize)]
struct LoginReply {
    token: String,
}

/// REST client for the management API
#[derive(Clone, Debug)]
pub struct PlatformClient {
    base: Uri,
    client: Client,
}

impl PlatformClient {
    /// Every call is bounded by `timeout`
    pub fn new(base: Uri, timeout: Duration) -> Self {
        Self {
            base,
            client: Client::new(Some(timeout)),
        }
    }

    #[instrument(level = "debug", skip_all, fields(method = %method, path = path, status = field::Empty))]
    async fn call(
        &self,
        token: Option<&BearerToken>,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Response, ApiError> {
        let uri = Uri::from_parts(self.base.clone(), path, None)?;
        let client = match token {
            Some(token) => self.client.clone().authorized(token),
            None => self.client.clone(),
        };

        trace!("{method} {uri}");
        let res = client
            .request(method, &uri, |req| {
                let req = req.query(query);
                Ok(match body {
                    Some(body) => req.json(body),
                    None => req,
                })
            })
            .await?;

        let status = res.status();
        Span::current().record("status", status.as_u16());
        if status.is_success() {
            return Ok(res);
        }
        let body = res.text().await.unwrap_or_default();
        Err(ApiError::from_status(status, body))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        token: &BearerToken,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ApiError> {
        let res = self
            .call(Some(token), Method::GET, path, query, None)
            .await?;
        Ok(res.json().await?)
    }

    /// Fetch every page of a text search
    async fn paged<T: DeserializeOwned>(
        &self,
        token: &BearerToken,
        path: &str,
        text_search: &str,
    ) -> Result<Vec<T>, ApiError> {
        let page_size = PAGE_SIZE.to_string();
        let mut items = Vec::new();
        let mut page = 0;
        loop {
            let page_num = page.to_string();
            let reply: Page<T> = self
                .get_json(
                    token,
                    path,
                    &[
                        ("pageSize", page_size.as_str()),
                        ("page", page_num.as_str()),
                        ("textSearch", text_search),
                    ],
                )
                .await?;
            items.extend(reply.data);
            if !reply.has_next {
                break;
            }
            page += 1;
        }
        Ok(items)
    }
}

fn relation_query(relation: &Relation) -> [(&str, &str); 5] {
    [
        ("fromId", relation.from.id.as_str()),
        ("fromType", relation.from.entity_type.as_str()),
        ("relationType", Relation::TYPE),
        ("toId", relation.to.id.as_str()),
        ("toType", relation.to.entity_type.as_str()),
    ]
}

fn attributes_path(entity: &EntityRef, suffix: &str) -> String {
    format!(
        "/api/plugins/telemetry/{}/{}/{suffix}",
        entity.entity_type.as_str(),
        entity.id
    )
}

fn none_if_not_found<T>(res: Result<T, ApiError>) -> Result<Option<T>, ApiError> {
    match res {
        Ok(value) => Ok(Some(value)),
        Err(ApiError::NotFound) => Ok(None),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl Platform for PlatformClient {
    async fn login(&self, username: &str, password: &str) -> Result<BearerToken, ApiError> {
        let body = json!({ "username": username, "password": password });
        let reply: LoginReply = self
            .call(None, Method::POST, "/api/auth/login", &[], Some(&body))
            .await?
            .json()
            .await?;
        Ok(BearerToken::from(reply.token))
    }

    async fn probe(&self, token: &BearerToken) -> Result<(), ApiError> {
        self.call(Some(token), Method::GET, "/api/auth/user", &[], None)
            .await?;
        Ok(())
    }

    async fn find_profile(
        &self,
        token: &BearerToken,
        kind: AssetKind,
        name: &str,
    ) -> Result<Option<ProfileId>, ApiError> {
        let path = match kind.entity_type() {
            EntityType::Asset => "/api/assetProfiles",
            EntityType::Device => "/api/deviceProfiles",
        };
        let profiles: Vec<ProfileEntry> = self.paged(token, path, name).await?;
        Ok(profiles
            .into_iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .map(|p| ProfileId(p.id.id)))
    }

    async fn find_nodes(
        &self,
        token: &BearerToken,
        kind: AssetKind,
        name: &str,
        profile: &str,
    ) -> Result<Vec<AssetNode>, ApiError> {
        let path = match kind.entity_type() {
            EntityType::Asset => "/api/tenant/assets",
            EntityType::Device => "/api/tenant/devices",
        };
        let entries: Vec<NodeEntry> = self.paged(token, path, name).await?;
        let nodes: Vec<AssetNode> = entries
            .into_iter()
            .filter(|e| e.name.eq_ignore_ascii_case(name))
            .filter(|e| kind == AssetKind::Device || e.profile.eq_ignore_ascii_case(profile))
            .map(|e| AssetNode {
                id: e.id,
                name: e.name,
                profile: e.profile,
                kind,
                location: None,
            })
            .collect();
        debug!("found {} {kind} node(s) named '{name}'", nodes.len());
        Ok(nodes)
    }

    async fn create_node(
        &self,
        token: &BearerToken,
        kind: AssetKind,
        name: &str,
        profile: &str,
        profile_id: &ProfileId,
    ) -> Result<AssetNode, ApiError> {
        let (path, body) = match kind.entity_type() {
            EntityType::Asset => (
                "/api/asset",
                json!({
                    "name": name,
                    "type": profile,
                    "assetProfileId": {"entityType": "ASSET_PROFILE", "id": profile_id.0},
                }),
            ),
            EntityType::Device => (
                "/api/device",
                json!({
                    "name": name,
                    "type": profile,
                    "deviceProfileId": {"entityType": "DEVICE_PROFILE", "id": profile_id.0},
                }),
            ),
        };
        let entry: NodeEntry = self
            .call(Some(token), Method::POST, path, &[], Some(&body))
            .await?
            .json()
            .await?;
        debug!("created {kind} '{}' ({})", entry.name, entry.id.id);
        Ok(AssetNode {
            id: entry.id,
            name: entry.name,
            profile: entry.profile,
            kind,
            location: None,
        })
    }

    async fn read_location(
        &self,
        token: &BearerToken,
        entity: &EntityRef,
    ) -> Result<Option<GeoPoint>, ApiError> {
        let path = attributes_path(entity, "values/attributes/SERVER_SCOPE");
        let attrs: Vec<AttributeEntry> = self
            .get_json(token, &path, &[("keys", "latitude,longitude")])
            .await?;

        let value_of = |key: &str| {
            attrs
                .iter()
                .find(|a| a.key == key)
                .and_then(|a| a.value.as_f64())
        };
        Ok(value_of("latitude")
            .zip(value_of("longitude"))
            .map(|(latitude, longitude)| GeoPoint {
                latitude,
                longitude,
            }))
    }

    async fn save_location(
        &self,
        token: &BearerToken,
        entity: &EntityRef,
        coordinates: &Coordinates,
    ) -> Result<(), ApiError> {
        let path = attributes_path(entity, "attributes/SERVER_SCOPE");
        let body = json!({
            "latitude": coordinates.latitude,
            "longitude": coordinates.longitude,
            "city": coordinates.city,
            "region": coordinates.region,
            "country": coordinates.country,
        });
        self.call(Some(token), Method::POST, &path, &[], Some(&body))
            .await?;
        Ok(())
    }

    async fn find_relation(
        &self,
        token: &BearerToken,
        from: &EntityRef,
        to: &EntityRef,
    ) -> Result<Option<Relation>, ApiError> {
        let relation = Relation {
            from: from.clone(),
            to: to.clone(),
        };
        let found: Option<RelationEntry> = none_if_not_found(
            self.get_json(token, "/api/relation", &relation_query(&relation))
                .await,
        )?;
        Ok(found.map(|_| relation))
    }

    async fn relations_to(
        &self,
        token: &BearerToken,
        to: &EntityRef,
    ) -> Result<Vec<Relation>, ApiError> {
        let entries: Vec<RelationEntry> = self
            .get_json(
                token,
                "/api/relations",
                &[
                    ("toId", to.id.as_str()),
                    ("toType", to.entity_type.as_str()),
                    ("relationType", Relation::TYPE),
                ],
            )
            .await?;
        Ok(entries
            .into_iter()
            .filter(|e| e.relation_type == Relation::TYPE)
            .map(|e| Relation {
                from: e.from,
                to: e.to,
            })
            .collect())
    }

    async fn create_relation(
        &self,
        token: &BearerToken,
        relation: &Relation,
    ) -> Result<(), ApiError> {
        let body = json!({
            "from": relation.from,
            "to": relation.to,
            "type": Relation::TYPE,
            "typeGroup": "COMMON",
        });
        self.call(Some(token), Method::POST, "/api/relation", &[], Some(&body))
            .await?;
        Ok(())
    }

    async fn delete_relation(
        &self,
        token: &BearerToken,
        relation: &Relation,
    ) -> Result<(), ApiError> {
        let res = self
            .call(
                Some(token),
                Method::DELETE,
                "/api/relation",
                &relation_query(relation),
                None,
            )
            .await;
        // already gone
        none_if_not_found(res)?;
        Ok(())
    }

    async fn device_credentials(
        &self,
        token: &BearerToken,
        device: &EntityRef,
    ) -> Result<Option<DeviceCredentials>, ApiError> {
        let path = format!("/api/device/{}/credentials", device.id);
        let entry: Option<CredentialsEntry> =
            none_if_not_found(self.get_json(token, &path, &[]).await)?;
        Ok(entry.map(|e| DeviceCredentials {
            credentials_type: e.credentials_type,
            credentials_id: e.credentials_id.unwrap_or_default(),
        }))
    }
}
