//! An in-memory vendor speaking the load-balancer and network actions,
//! recording every call.

use crate::client::{ClientError, Params, VendorClient};
use crate::listener::Protocol;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

pub const REGION: &str = "eu-central-1";

pub fn policy() -> RetryPolicy {
    RetryPolicy {
        timeout: Duration::from_secs(60),
        initial_backoff: Duration::from_secs(1),
        backoff_step: Duration::from_secs(1),
        max_backoff: Duration::from_secs(5),
        poll_interval: Duration::from_secs(2),
    }
}

#[derive(Default)]
pub struct FakeVendor {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    calls: Vec<(String, Params)>,
    failures: HashMap<String, (String, usize)>,
    load_balancers: IndexMap<String, LoadBalancer>,
    vpcs: IndexMap<String, Vpc>,
    next_id: usize,
}

#[derive(Default)]
struct LoadBalancer {
    spec: String,
    listeners: BTreeMap<u16, Listener>,
}

struct Listener {
    protocol: Protocol,
    attributes: Params,
    status: &'static str,
}

#[derive(Default)]
struct Vpc {
    router: String,
    attributes: Params,
    user_cidrs: Vec<String>,
    secondary_cidrs: Vec<String>,
    classic_link: bool,
    tags: IndexMap<String, String>,
}

fn not_found(code: &str) -> ClientError {
    ClientError::service(code, "The specified resource does not exist.")
}

/// Numbers come back as floats, like from the real API.
fn vendor_value(value: &str) -> Value {
    match value.parse::<i64>() {
        Ok(i) => json!(i as f64),
        Err(_) => json!(value),
    }
}

fn param<'a>(params: &'a Params, key: &str) -> &'a str {
    params.get(key).map(String::as_str).unwrap_or_default()
}

fn listener_protocol(action: &str, prefix: &str, suffix: &str) -> Option<Protocol> {
    action
        .strip_prefix(prefix)?
        .strip_suffix(suffix)?
        .parse()
        .ok()
}

impl FakeVendor {
    pub fn with_load_balancer(self, id: &str, spec: &str) -> Self {
        self.lock().load_balancers.insert(
            id.to_string(),
            LoadBalancer {
                spec: spec.to_string(),
                ..Default::default()
            },
        );
        self
    }

    /// Answer the next `times` calls of `action` with the error `code`.
    pub fn fail(&self, action: &str, code: &str, times: usize) {
        self.lock()
            .failures
            .insert(action.to_string(), (code.to_string(), times));
    }

    pub fn actions(&self) -> Vec<String> {
        self.lock().calls.iter().map(|(a, _)| a.clone()).collect()
    }

    pub fn count(&self, action: &str) -> usize {
        self.calls_of(action).len()
    }

    pub fn calls_of(&self, action: &str) -> Vec<Params> {
        self.lock()
            .calls
            .iter()
            .filter(|(a, _)| a == action)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Change a listener behind the reconciler's back.
    pub fn set_listener_attribute(&self, load_balancer: &str, port: u16, key: &str, value: &str) {
        let mut inner = self.lock();
        if let Some(listener) = inner
            .load_balancers
            .get_mut(load_balancer)
            .and_then(|lb| lb.listeners.get_mut(&port))
        {
            listener.attributes.insert(key.to_string(), value.to_string());
        }
    }

    pub fn remove_listener(&self, load_balancer: &str, port: u16) {
        if let Some(lb) = self.lock().load_balancers.get_mut(load_balancer) {
            lb.listeners.remove(&port);
        }
    }

    pub fn listener_ports(&self, load_balancer: &str) -> Vec<u16> {
        self.lock()
            .load_balancers
            .get(load_balancer)
            .map(|lb| lb.listeners.keys().copied().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }
}

impl Inner {
    fn load_balancer(&mut self, params: &Params) -> Result<&mut LoadBalancer, ClientError> {
        self.load_balancers
            .get_mut(param(params, "LoadBalancerId"))
            .ok_or_else(|| not_found("InvalidLoadBalancerId.NotFound"))
    }

    fn listener(&mut self, params: &Params) -> Result<&mut Listener, ClientError> {
        let port: u16 = param(params, "ListenerPort").parse().unwrap_or_default();
        self.load_balancer(params)?
            .listeners
            .get_mut(&port)
            .ok_or_else(|| not_found("ListenerNotExist"))
    }

    fn vpc(&mut self, id: &str) -> Result<&mut Vpc, ClientError> {
        self.vpcs
            .get_mut(id)
            .ok_or_else(|| not_found("InvalidVpcID.NotFound"))
    }

    fn dispatch(&mut self, action: &str, params: &Params) -> Result<Value, ClientError> {
        if let Some(protocol) = listener_protocol(action, "CreateLoadBalancer", "Listener") {
            let port: u16 = param(params, "ListenerPort").parse().unwrap_or_default();
            let lb = self.load_balancer(params)?;
            if lb.listeners.contains_key(&port) {
                return Err(ClientError::service("ListenerAlreadyExists", "port in use"));
            }
            lb.listeners.insert(
                port,
                Listener {
                    protocol,
                    attributes: params.clone(),
                    status: "stopped",
                },
            );
            return Ok(json!({}));
        }
        if let Some(protocol) = listener_protocol(action, "DescribeLoadBalancer", "ListenerAttribute") {
            let listener = self.listener(params)?;
            if listener.protocol != protocol {
                return Err(not_found("ListenerNotExist"));
            }
            let hidden = listener.hidden();
            let mut body: serde_json::Map<String, Value> = listener
                .attributes
                .iter()
                .filter(|(k, _)| !hidden.iter().any(|h| *h == k.as_str()))
                .map(|(k, v)| (k.clone(), vendor_value(v)))
                .collect();
            if matches!(listener.protocol, Protocol::Http | Protocol::Https) {
                body.insert("XForwardedFor".into(), json!("on"));
            }
            body.insert("Status".into(), json!(listener.status));
            return Ok(Value::Object(body));
        }
        if listener_protocol(action, "SetLoadBalancer", "ListenerAttribute").is_some() {
            let listener = self.listener(params)?;
            listener.attributes.extend(params.clone());
            for (switch, id) in [
                ("VServerGroup", "VServerGroupId"),
                ("MasterSlaveServerGroup", "MasterSlaveServerGroupId"),
            ] {
                if param(params, switch) == "off" {
                    listener.attributes.shift_remove(id);
                }
            }
            listener.attributes.retain(|_, v| !v.is_empty());
            return Ok(json!({}));
        }

        match action {
            "DescribeLoadBalancerAttribute" => {
                let lb = self.load_balancer(params)?;
                let listeners: Vec<Value> = lb
                    .listeners
                    .iter()
                    .map(|(port, l)| {
                        json!({"ListenerPort": f64::from(*port), "ListenerProtocol": l.protocol.as_str()})
                    })
                    .collect();
                Ok(json!({
                    "LoadBalancerId": param(params, "LoadBalancerId"),
                    "LoadBalancerSpec": lb.spec,
                    "ListenerPortsAndProtocol": {"ListenerPortAndProtocol": listeners},
                }))
            }
            "StartLoadBalancerListener" => {
                self.listener(params)?.status = "running";
                Ok(json!({}))
            }
            "DeleteLoadBalancerListener" => {
                let port: u16 = param(params, "ListenerPort").parse().unwrap_or_default();
                self.load_balancer(params)?
                    .listeners
                    .remove(&port)
                    .ok_or_else(|| not_found("ListenerNotExist"))?;
                Ok(json!({}))
            }
            "CreateVpc" => {
                self.next_id += 1;
                let id = format!("vpc-{:04}", self.next_id);
                let mut vpc = Vpc {
                    router: format!("vrt-{:04}", self.next_id),
                    ..Default::default()
                };
                for key in ["CidrBlock", "VpcName", "Description", "ResourceGroupId", "Ipv6Isp", "IpVersion"] {
                    if let Some(value) = params.get(key) {
                        vpc.attributes.insert(key.to_string(), value.clone());
                    }
                }
                vpc.set_ipv6(param(params, "EnableIPv6"));
                vpc.user_cidrs = param(params, "UserCidr")
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                let router = vpc.router.clone();
                self.vpcs.insert(id.clone(), vpc);
                Ok(json!({"VpcId": id, "VRouterId": router, "RequestId": "req-1"}))
            }
            "DescribeVpcAttribute" => {
                let id = param(params, "VpcId");
                let vpc = self.vpc(id)?;
                Ok(vpc.render(id))
            }
            "ModifyVpcAttribute" => {
                let vpc = self.vpc(param(params, "VpcId"))?;
                for key in ["CidrBlock", "VpcName", "Description", "Ipv6Isp"] {
                    if let Some(value) = params.get(key) {
                        vpc.attributes.insert(key.to_string(), value.clone());
                    }
                }
                if let Some(enable) = params.get("EnableIPv6") {
                    vpc.set_ipv6(enable);
                }
                Ok(json!({}))
            }
            "MoveResourceGroup" => {
                let vpc = self.vpc(param(params, "ResourceId"))?;
                vpc.attributes.insert(
                    "ResourceGroupId".into(),
                    param(params, "NewResourceGroupId").to_string(),
                );
                Ok(json!({}))
            }
            "EnableVpcClassicLink" | "DisableVpcClassicLink" => {
                self.vpc(param(params, "VpcId"))?.classic_link = action.starts_with("Enable");
                Ok(json!({}))
            }
            "AssociateVpcCidrBlock" => {
                let cidr = param(params, "SecondaryCidrBlock").to_string();
                self.vpc(param(params, "VpcId"))?.secondary_cidrs.push(cidr);
                Ok(json!({}))
            }
            "UnassociateVpcCidrBlock" => {
                let cidr = param(params, "SecondaryCidrBlock").to_string();
                self.vpc(param(params, "VpcId"))?
                    .secondary_cidrs
                    .retain(|c| *c != cidr);
                Ok(json!({}))
            }
            "TagResources" => {
                let vpc = self.vpc(param(params, "ResourceId.1"))?;
                for i in 1.. {
                    match params.get(&format!("Tag.{i}.Key")) {
                        Some(key) => {
                            let value = param(params, &format!("Tag.{i}.Value")).to_string();
                            vpc.tags.insert(key.clone(), value);
                        }
                        None => break,
                    }
                }
                Ok(json!({}))
            }
            "UnTagResources" => {
                let vpc = self.vpc(param(params, "ResourceId.1"))?;
                for i in 1.. {
                    match params.get(&format!("TagKey.{i}")) {
                        Some(key) => {
                            vpc.tags.shift_remove(key);
                        }
                        None => break,
                    }
                }
                Ok(json!({}))
            }
            "DeleteVpc" => {
                self.vpcs
                    .shift_remove(param(params, "VpcId"))
                    .ok_or_else(|| not_found("InvalidVpcID.NotFound"))?;
                Ok(json!({}))
            }
            _ => Err(ClientError::service(
                "InvalidAction.NotFound",
                format!("unknown action {action}"),
            )),
        }
    }
}

const HEALTH_CHECK: &[&str] = &[
    "HealthCheckConnectPort",
    "HealthyThreshold",
    "UnhealthyThreshold",
    "HealthCheckTimeout",
    "HealthCheckInterval",
];
const HTTP_PROBE: &[&str] = &["HealthCheckDomain", "HealthCheckURI", "HealthCheckHttpCode"];

impl Listener {
    /// Attributes the vendor leaves out of a description because other
    /// settings switch them off.
    fn hidden(&self) -> Vec<&'static str> {
        let is = |key: &str, value: &str| self.attributes.get(key).map(String::as_str) == Some(value);
        let mut hidden = Vec::new();
        if !is("StickySession", "on") {
            hidden.extend(["StickySessionType", "Cookie", "CookieTimeout"]);
        }
        if !is("AclStatus", "on") {
            hidden.extend(["AclType", "AclId"]);
        }
        match self.protocol {
            Protocol::Http | Protocol::Https if !is("HealthCheck", "on") => {
                hidden.extend(HEALTH_CHECK);
                hidden.extend(HTTP_PROBE);
            }
            Protocol::Tcp if !is("HealthCheckType", "http") => hidden.extend(HTTP_PROBE),
            _ => {}
        }
        hidden
    }
}

impl Vpc {
    fn set_ipv6(&mut self, enable: &str) {
        let block = if enable == "true" { "2408:4005:3a7::/56" } else { "" };
        self.attributes
            .insert("Ipv6CidrBlock".into(), block.to_string());
    }

    fn render(&self, id: &str) -> Value {
        let mut body: serde_json::Map<String, Value> = self
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), json!(v)))
            .collect();
        let tags: Vec<Value> = self
            .tags
            .iter()
            .map(|(k, v)| json!({"Key": k, "Value": v}))
            .collect();
        body.extend([
            ("VpcId".to_string(), json!(id)),
            ("RegionId".to_string(), json!(REGION)),
            ("Status".to_string(), json!("Available")),
            ("VRouterId".to_string(), json!(self.router)),
            ("IsDefault".to_string(), json!(false)),
            ("ClassicLinkEnabled".to_string(), json!(self.classic_link)),
            ("UserCidrs".to_string(), json!({"UserCidr": self.user_cidrs})),
            (
                "SecondaryCidrBlocks".to_string(),
                json!({"SecondaryCidrBlock": self.secondary_cidrs}),
            ),
            ("VSwitchIds".to_string(), json!({"VSwitchId": []})),
            ("Tags".to_string(), json!({"Tag": tags})),
        ]);
        Value::Object(body)
    }
}

#[async_trait]
impl VendorClient for FakeVendor {
    async fn call(&self, action: &str, params: &Params) -> Result<Value, ClientError> {
        let mut inner = self.lock();
        inner.calls.push((action.to_string(), params.clone()));

        if let Some((code, remaining)) = inner.failures.get_mut(action) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ClientError::service(code.clone(), "scripted failure"));
            }
        }

        inner.dispatch(action, params)
    }

    fn region(&self) -> &str {
        REGION
    }
}
