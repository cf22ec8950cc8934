//! Virtual private networks.
//!
//! Unlike listeners, a network spreads its settings over several vendor
//! endpoints, so an update issues one call per changed group.

use crate::client::{Params, VendorClient};
use crate::error::{ReconcileError, Result};
use crate::identity::ResourceIdentity;
use crate::reconciler::{self, Api, ErrorCodes, ResourceController};
use crate::retry::RetryPolicy;
use crate::state::{ChangeSet, DesiredState, FieldValue, ObservedState};
use async_trait::async_trait;
use indexmap::{IndexMap, IndexSet};
use serde_json::{Map, Value};

pub const KIND: &str = "vpc";

static CODES: ErrorCodes = ErrorCodes {
    transient: &[
        "Throttling",
        "TaskConflict",
        "UnknownError",
        "IncorrectVpcStatus",
        "InternalError",
        "OperationConflict",
    ],
    not_found: &["Forbidden.VpcNotFound", "InvalidVpcID.NotFound"],
};

const AVAILABLE: &str = "Available";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    Str,
    Bool,
    /// Set on the vendor side whenever the response key holds a value.
    Presence,
    /// Order-insensitive list of strings.
    List,
    Tags,
}

/// How a change to a field reaches the vendor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Group {
    Attribute,
    ResourceGroup,
    ClassicLink,
    SecondaryCidrs,
    Tags,
    ForceNew,
    Computed,
}

/// Order in which groups are applied on update.
const GROUPS: &[Group] = &[
    Group::Attribute,
    Group::ResourceGroup,
    Group::ClassicLink,
    Group::SecondaryCidrs,
    Group::Tags,
];

struct Field {
    name: &'static str,
    /// Create and attribute request parameter, empty if the field can only
    /// be set through its own group.
    param: &'static str,
    /// Key in the describe response.
    key: &'static str,
    kind: Kind,
    group: Group,
}

const fn field(
    name: &'static str,
    param: &'static str,
    key: &'static str,
    kind: Kind,
    group: Group,
) -> Field {
    Field {
        name,
        param,
        key,
        kind,
        group,
    }
}

static FIELDS: &[Field] = &[
    field("cidr_block", "CidrBlock", "CidrBlock", Kind::Str, Group::Attribute),
    field("vpc_name", "VpcName", "VpcName", Kind::Str, Group::Attribute),
    field("description", "Description", "Description", Kind::Str, Group::Attribute),
    field("enable_ipv6", "EnableIPv6", "Ipv6CidrBlock", Kind::Presence, Group::Attribute),
    field("ipv6_isp", "Ipv6Isp", "Ipv6Isp", Kind::Str, Group::Attribute),
    field("resource_group_id", "ResourceGroupId", "ResourceGroupId", Kind::Str, Group::ResourceGroup),
    field("classic_link_enabled", "", "ClassicLinkEnabled", Kind::Bool, Group::ClassicLink),
    field("secondary_cidr_blocks", "", "SecondaryCidrBlocks", Kind::List, Group::SecondaryCidrs),
    field("tags", "", "Tags", Kind::Tags, Group::Tags),
    field("user_cidrs", "UserCidr", "UserCidrs", Kind::List, Group::ForceNew),
    field("ip_version", "IpVersion", "IpVersion", Kind::Str, Group::ForceNew),
    field("status", "", "Status", Kind::Str, Group::Computed),
    field("router_id", "", "VRouterId", Kind::Str, Group::Computed),
];

fn lookup(name: &str) -> Option<&'static Field> {
    FIELDS.iter().find(|f| f.name == name)
}

fn sorted(list: &[FieldValue]) -> FieldValue {
    let mut items: Vec<FieldValue> = list.to_vec();
    items.sort_by(|a, b| a.to_param().cmp(&b.to_param()));
    items.dedup();
    FieldValue::List(items)
}

fn strings(value: Option<&FieldValue>) -> IndexSet<String> {
    value
        .and_then(FieldValue::as_list)
        .map(|items| items.iter().map(FieldValue::to_param).collect())
        .unwrap_or_default()
}

fn tags(value: Option<&FieldValue>) -> IndexMap<String, String> {
    value
        .and_then(FieldValue::as_map)
        .map(|tags| tags.iter().map(|(k, v)| (k.clone(), v.to_param())).collect())
        .unwrap_or_default()
}

/// Desired state with computed fields rejected and lists put in a
/// comparable order.
pub fn effective(desired: &DesiredState) -> Result<DesiredState> {
    desired
        .iter()
        .map(|(name, value)| {
            let field = lookup(name)
                .filter(|f| f.group != Group::Computed)
                .ok_or_else(|| {
                    ReconcileError::validation(format!("'{name}': unknown or read-only vpc field"))
                })?;
            let value = match (field.kind, value) {
                (Kind::List, FieldValue::List(items)) => sorted(items),
                (Kind::Bool | Kind::Presence, FieldValue::String(_)) => {
                    value.as_bool().map(FieldValue::Bool).unwrap_or_else(|| value.clone())
                }
                _ => value.clone(),
            };
            Ok((name.clone(), value))
        })
        .collect()
}

pub fn validate(desired: &DesiredState) -> Result<()> {
    for (name, value) in desired.iter() {
        let field = match lookup(name) {
            Some(field) => field,
            None => continue,
        };
        let invalid = |what: &str| ReconcileError::validation(format!("'{name}': {what}"));
        match field.kind {
            Kind::Str if value.as_str().is_none() => return Err(invalid("expected a string")),
            Kind::Bool | Kind::Presence if value.as_bool().is_none() => {
                return Err(invalid("expected a boolean"))
            }
            Kind::List => {
                let items = value.as_list().ok_or_else(|| invalid("expected a list"))?;
                if items.iter().any(|i| i.as_str().map_or(true, str::is_empty)) {
                    return Err(invalid("expected a list of non-empty strings"));
                }
            }
            Kind::Tags => {
                let tags = value.as_map().ok_or_else(|| invalid("expected a map"))?;
                if tags.len() > 20 {
                    return Err(invalid("at most 20 tags are supported"));
                }
                if tags.keys().any(|k| k.is_empty() || k.starts_with("aliyun") || k.starts_with("acs:")) {
                    return Err(invalid("tag keys must be non-empty and not use a reserved prefix"));
                }
            }
            _ => {}
        }
    }

    for name in ["vpc_name", "description"] {
        if let Some(value) = desired.get_str(name) {
            if value.starts_with("http://") || value.starts_with("https://") {
                return Err(ReconcileError::validation(format!(
                    "'{name}': must not start with http:// or https://"
                )));
            }
        }
    }
    if let Some(name) = desired.get_str("vpc_name") {
        if name.is_empty() || name.chars().count() > 128 {
            return Err(ReconcileError::validation(
                "'vpc_name': must be 1 to 128 characters long",
            ));
        }
    }
    if let Some(version) = desired.get_str("ip_version") {
        if version != "IPv4" && version != "IPv6" {
            return Err(ReconcileError::validation(format!(
                "'ip_version': unsupported value '{version}', expected IPv4 or IPv6"
            )));
        }
    }
    if desired.get_bool("enable_ipv6") != Some(true) && desired.contains("ipv6_isp") {
        return Err(ReconcileError::validation(
            "'ipv6_isp': requires 'enable_ipv6'",
        ));
    }
    Ok(())
}

fn encode(field: &Field, value: &FieldValue, params: &mut Params) {
    let value = match field.kind {
        Kind::List => strings(Some(value)).into_iter().collect::<Vec<_>>().join(","),
        _ => value.to_param(),
    };
    params.insert(field.param.to_string(), value);
}

fn decode(field: &Field, vpc: &Map<String, Value>) -> Option<FieldValue> {
    let value = vpc.get(field.key).and_then(FieldValue::from_vendor);
    match field.kind {
        Kind::Str => value.map(|v| FieldValue::String(v.to_param())),
        Kind::Bool => value.and_then(|v| v.as_bool()).map(FieldValue::Bool),
        Kind::Presence => Some(FieldValue::Bool(
            value.map_or(false, |v| !v.to_param().is_empty()),
        )),
        Kind::List => Some(match value {
            Some(FieldValue::List(items)) => sorted(&items),
            _ => FieldValue::List(Vec::new()),
        }),
        Kind::Tags => {
            let tags: IndexMap<String, FieldValue> = value
                .as_ref()
                .and_then(FieldValue::as_list)
                .unwrap_or_default()
                .iter()
                .filter_map(|tag| {
                    let tag = tag.as_map()?;
                    let key = tag.get("Key")?.as_str()?;
                    let value = tag.get("Value").map(FieldValue::to_param).unwrap_or_default();
                    Some((key.to_string(), FieldValue::String(value)))
                })
                .collect();
            Some(FieldValue::Map(tags))
        }
    }
}

/// Flatten a network description into observed state.
pub fn observe(vpc: &Map<String, Value>) -> ObservedState {
    FIELDS
        .iter()
        .filter_map(|field| decode(field, vpc).map(|value| (field.name.to_string(), value)))
        .collect()
}

/// Vendor request creating the network.
pub fn create_params(desired: &DesiredState) -> Params {
    let mut params = Params::new();
    for (name, value) in desired.iter() {
        match lookup(name) {
            Some(field) if !field.param.is_empty() => encode(field, value, &mut params),
            _ => {}
        }
    }
    params
}

pub struct VpcController<C> {
    api: Api<C>,
}

impl<C: VendorClient> VpcController<C> {
    pub fn new(client: C, policy: RetryPolicy) -> Self {
        Self {
            api: Api::new(client, policy, &CODES),
        }
    }

    fn params(identity: &ResourceIdentity) -> Params {
        let mut params = Params::new();
        params.insert("RegionId".into(), identity.parent().to_string());
        params.insert("VpcId".into(), identity.discriminant().to_string());
        params
    }

    async fn call(&self, action: &str, identity: &ResourceIdentity, params: Params) -> Result<()> {
        self.api.call(action, &identity.to_string(), &params).await.map(|_| ())
    }

    async fn wait_for_available(&self, identity: &ResourceIdentity) -> Result<Option<ObservedState>> {
        reconciler::wait_for(
            self.api.policy(),
            "vpc available",
            identity,
            || self.read(identity),
            reconciler::has_status(AVAILABLE),
        )
        .await
    }

    async fn apply(
        &self,
        group: Group,
        identity: &ResourceIdentity,
        desired: &DesiredState,
        observed: &ObservedState,
        changes: &ChangeSet,
    ) -> Result<()> {
        match group {
            Group::Attribute => {
                let mut params = Self::params(identity);
                for name in changes.iter() {
                    match (lookup(name), desired.get(name)) {
                        (Some(field), Some(value)) if field.group == Group::Attribute => {
                            encode(field, value, &mut params)
                        }
                        _ => {}
                    }
                }
                self.call("ModifyVpcAttribute", identity, params).await
            }
            Group::ResourceGroup => {
                let mut params = Params::new();
                params.insert("RegionId".into(), identity.parent().to_string());
                params.insert("ResourceId".into(), identity.discriminant().to_string());
                params.insert("ResourceType".into(), KIND.to_string());
                params.insert(
                    "NewResourceGroupId".into(),
                    desired.get("resource_group_id").map(FieldValue::to_param).unwrap_or_default(),
                );
                self.call("MoveResourceGroup", identity, params).await
            }
            Group::ClassicLink => {
                let action = if desired.get_bool("classic_link_enabled") == Some(true) {
                    "EnableVpcClassicLink"
                } else {
                    "DisableVpcClassicLink"
                };
                self.call(action, identity, Self::params(identity)).await
            }
            Group::SecondaryCidrs => {
                let want = strings(desired.get("secondary_cidr_blocks"));
                let have = strings(observed.get("secondary_cidr_blocks"));
                for cidr in have.difference(&want) {
                    let mut params = Self::params(identity);
                    params.insert("SecondaryCidrBlock".into(), cidr.clone());
                    self.call("UnassociateVpcCidrBlock", identity, params).await?;
                }
                for cidr in want.difference(&have) {
                    let mut params = Self::params(identity);
                    params.insert("SecondaryCidrBlock".into(), cidr.clone());
                    self.call("AssociateVpcCidrBlock", identity, params).await?;
                }
                Ok(())
            }
            Group::Tags => {
                let want = tags(desired.get("tags"));
                let have = tags(observed.get("tags"));
                let resource = |params: &mut Params| {
                    params.insert("RegionId".into(), identity.parent().to_string());
                    params.insert("ResourceType".into(), "VPC".into());
                    params.insert("ResourceId.1".into(), identity.discriminant().to_string());
                };

                let removed: Vec<&String> = have.keys().filter(|k| !want.contains_key(*k)).collect();
                if !removed.is_empty() {
                    let mut params = Params::new();
                    resource(&mut params);
                    for (i, key) in removed.into_iter().enumerate() {
                        params.insert(format!("TagKey.{}", i + 1), key.clone());
                    }
                    self.call("UnTagResources", identity, params).await?;
                }

                let added: Vec<(&String, &String)> =
                    want.iter().filter(|(k, v)| have.get(*k) != Some(*v)).collect();
                if !added.is_empty() {
                    let mut params = Params::new();
                    resource(&mut params);
                    for (i, (key, value)) in added.into_iter().enumerate() {
                        params.insert(format!("Tag.{}.Key", i + 1), key.clone());
                        params.insert(format!("Tag.{}.Value", i + 1), value.clone());
                    }
                    self.call("TagResources", identity, params).await?;
                }
                Ok(())
            }
            Group::ForceNew | Group::Computed => Ok(()),
        }
    }
}

#[async_trait]
impl<C: VendorClient> ResourceController for VpcController<C> {
    fn kind(&self) -> &'static str {
        KIND
    }

    async fn create(&self, desired: &DesiredState) -> Result<ResourceIdentity> {
        let desired = effective(desired)?;
        validate(&desired)?;

        let region = self.api.region().to_string();
        let mut params = create_params(&desired);
        params.insert("RegionId".into(), region.clone());
        log::info!("Creating vpc in {region}");

        let response = self.api.call("CreateVpc", &region, &params).await?;
        let vpc_id = response
            .get("VpcId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                ReconcileError::remote(
                    "CreateVpc",
                    &region,
                    crate::client::ClientError::Request("response carries no VpcId".into()),
                )
            })?;
        Ok(ResourceIdentity::new(region, vpc_id))
    }

    async fn activate(
        &self,
        identity: &ResourceIdentity,
        desired: &DesiredState,
    ) -> Result<ObservedState> {
        let observed = self
            .wait_for_available(identity)
            .await?
            .ok_or_else(|| ReconcileError::NotFound {
                action: "vpc available".to_string(),
                identity: identity.to_string(),
            })?;
        // settings only reachable through their own endpoints
        let observed = self.update(identity, desired, &observed).await?;
        Ok(observed.unwrap_or_default())
    }

    fn is_active(&self, observed: &ObservedState) -> bool {
        reconciler::has_status(AVAILABLE)(Some(observed))
    }

    async fn read(&self, identity: &ResourceIdentity) -> Result<Option<ObservedState>> {
        let vpc = self
            .api
            .describe("DescribeVpcAttribute", &identity.to_string(), &Self::params(identity))
            .await?;
        match vpc {
            Some(Value::Object(vpc))
                if vpc.get("VpcId").and_then(Value::as_str) == Some(identity.discriminant()) =>
            {
                Ok(Some(observe(&vpc)))
            }
            _ => Ok(None),
        }
    }

    async fn update(
        &self,
        identity: &ResourceIdentity,
        desired: &DesiredState,
        observed: &ObservedState,
    ) -> Result<Option<ObservedState>> {
        let desired = effective(desired)?;
        validate(&desired)?;

        let changes = ChangeSet::between(&desired, observed);
        if changes.is_empty() {
            return Ok(Some(observed.clone()));
        }
        if self.requires_replacement(&changes) {
            return Err(ReconcileError::validation(format!(
                "vpc {identity}: {changes} can not be changed in place"
            )));
        }

        log::info!("Updating vpc {identity}: {changes}");
        for group in GROUPS {
            let touched = changes
                .iter()
                .filter_map(lookup)
                .any(|field| field.group == *group);
            if touched {
                log::debug!("Applying {group:?} changes to {identity}");
                self.apply(*group, identity, &desired, observed, &changes).await?;
            }
        }

        self.wait_for_available(identity).await
    }

    async fn delete(&self, identity: &ResourceIdentity) -> Result<()> {
        log::info!("Deleting vpc {identity}");
        self.api
            .remove("DeleteVpc", &identity.to_string(), &Self::params(identity))
            .await?;

        reconciler::wait_for(
            self.api.policy(),
            "vpc deleted",
            identity,
            || self.read(identity),
            reconciler::is_absent,
        )
        .await
        .map(|_| ())
    }

    fn changes(&self, desired: &DesiredState, observed: &ObservedState) -> Result<ChangeSet> {
        Ok(ChangeSet::between(&effective(desired)?, observed))
    }

    fn requires_replacement(&self, changes: &ChangeSet) -> bool {
        changes
            .iter()
            .filter_map(lookup)
            .any(|f| f.group == Group::ForceNew)
    }

    fn backfill(&self, observed: &ObservedState) -> DesiredState {
        observed
            .iter()
            .filter(|(name, _)| lookup(name).map_or(false, |f| f.group != Group::Computed))
            .filter(|(name, value)| {
                // the vendor reports an empty ipv6 setting for every network
                !(name.as_str() == "ipv6_isp" && value.to_param().is_empty())
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}
