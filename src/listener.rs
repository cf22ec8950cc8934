//! Load-balancer listeners.
//!
//! A listener's behaviour is selected by its protocol. [`FIELDS`] is the
//! capability table: which protocols a field applies to, how it is encoded
//! for the vendor, its schema default and how a change to it is applied.

use crate::client::{Params, VendorClient};
use crate::error::{ReconcileError, Result};
use crate::identity::ResourceIdentity;
use crate::reconciler::{self, Api, ErrorCodes, ResourceController};
use crate::retry::RetryPolicy;
use crate::state::{ChangeSet, DesiredState, FieldValue, ObservedState};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

pub const KIND: &str = "listener";

static CODES: ErrorCodes = ErrorCodes {
    transient: &[
        "Throttling",
        "SystemBusy",
        "OperationBusy",
        "ServiceIsStopping",
        "ServiceIsConfiguring",
        "BackendServer.configuring",
    ],
    not_found: &["InvalidLoadBalancerId.NotFound", "ListenerNotExist"],
};

const DESCRIBE_LOAD_BALANCER: &str = "DescribeLoadBalancerAttribute";
const START_LISTENER: &str = "StartLoadBalancerListener";
const DELETE_LISTENER: &str = "DeleteLoadBalancerListener";

const STOPPED: &str = "stopped";
const RUNNING: &str = "running";

/// Backend port sent in forward mode when none is declared; the vendor
/// rejects the request without one.
const FORWARD_BACKEND_PORT: i64 = 80;

const ON: &str = "on";
const OFF: &str = "off";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Stream
    Tcp,
    /// Datagram
    Udp,
    /// Request/response
    Http,
    /// Secure request/response
    Https,
}

use Protocol::{Http, Https, Tcp, Udp};

impl Protocol {
    fn api_name(self) -> &'static str {
        match self {
            Tcp => "TCP",
            Udp => "UDP",
            Http => "HTTP",
            Https => "HTTPS",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tcp => "tcp",
            Udp => "udp",
            Http => "http",
            Https => "https",
        }
    }

    pub fn create_action(self) -> String {
        format!("CreateLoadBalancer{}Listener", self.api_name())
    }

    pub fn describe_action(self) -> String {
        format!("DescribeLoadBalancer{}ListenerAttribute", self.api_name())
    }

    /// The attribute endpoint that takes every in-place change.
    pub fn update_action(self) -> String {
        format!("SetLoadBalancer{}ListenerAttribute", self.api_name())
    }

    /// Fields the vendor refuses to work without.
    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            Https => &["ssl_certificate_id"],
            _ => &[],
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Tcp),
            "udp" => Ok(Udp),
            "http" => Ok(Http),
            "https" => Ok(Https),
            _ => Err(ReconcileError::validation(format!(
                "'protocol': unsupported value '{s}', expected one of tcp, udp, http, https"
            ))),
        }
    }
}

/// The protocol plus whether the listener forwards to another listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Variant {
    pub protocol: Protocol,
    pub forward: bool,
}

impl Variant {
    pub fn of(desired: &DesiredState) -> Result<Self> {
        let protocol: Protocol = desired
            .get_str("protocol")
            .ok_or_else(|| ReconcileError::validation("'protocol': required field is not set"))?
            .parse()?;
        let forward = desired.get_str("listener_forward") == Some(ON);
        if forward && protocol != Http {
            return Err(ReconcileError::validation(format!(
                "'listener_forward': only supported by http listeners, not '{protocol}'"
            )));
        }
        Ok(Self { protocol, forward })
    }

    fn applies(&self, field: &Field) -> bool {
        field.protocols.contains(&self.protocol) && (!self.forward || field.forward)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    Str,
    Int,
    /// Boolean sent as `on`/`off`.
    Switch,
    /// The X-Forwarded-For flags, spread over several parameters.
    ForwardedFor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    /// Changing it means replacing the listener.
    ForceNew,
    /// Changed through the protocol's attribute endpoint.
    Attribute,
}

#[derive(Clone, Copy, Debug)]
enum Fallback {
    Str(&'static str),
    Int(i64),
    Bool(bool),
}

impl Fallback {
    fn value(self) -> FieldValue {
        match self {
            Self::Str(s) => s.into(),
            Self::Int(i) => i.into(),
            Self::Bool(b) => b.into(),
        }
    }
}

/// Settings a field only matters under. The vendor neither reports nor
/// honours the field otherwise.
#[derive(Clone, Copy, Debug)]
enum Condition {
    /// Every named field holds the given value.
    Equals(&'static [(&'static str, &'static str)]),
    /// Health check tuning: http family listeners with `health_check` off
    /// have none.
    HealthCheck,
    /// HTTP probe settings: http family listeners with checks on, tcp
    /// listeners probing over http.
    HttpProbe,
}

impl Condition {
    fn holds(self, protocol: Protocol, state: &DesiredState) -> bool {
        let health_check = || state.get_str("health_check") == Some(ON);
        match self {
            Self::Equals(pairs) => pairs
                .iter()
                .all(|(name, value)| state.get_str(name) == Some(*value)),
            Self::HealthCheck => match protocol {
                Http | Https => health_check(),
                Tcp | Udp => true,
            },
            Self::HttpProbe => match protocol {
                Http | Https => health_check(),
                Tcp => state.get_str("health_check_type") == Some("http"),
                Udp => false,
            },
        }
    }
}

#[derive(Debug)]
pub struct Field {
    pub name: &'static str,
    param: &'static str,
    kind: Kind,
    protocols: &'static [Protocol],
    default: Option<Fallback>,
    range: Option<(i64, i64)>,
    allowed: &'static [&'static str],
    mode: Mode,
    /// Still applies when the listener is in forward mode.
    forward: bool,
    when: Option<Condition>,
    /// Removing it from the declaration resets it on the vendor side.
    clearable: bool,
}

const ALL: &[Protocol] = &[Tcp, Udp, Http, Https];
const HTTP_FAMILY: &[Protocol] = &[Http, Https];
const HEALTH_URI: &[Protocol] = &[Tcp, Http, Https];
const TCP_UDP: &[Protocol] = &[Tcp, Udp];
const TCP_ONLY: &[Protocol] = &[Tcp];
const HTTP_ONLY: &[Protocol] = &[Http];
const HTTPS_ONLY: &[Protocol] = &[Https];

const ON_OFF: &[&str] = &[ON, OFF];
const ACL_ON: Condition = Condition::Equals(&[("acl_status", ON)]);
const STICKY: Condition = Condition::Equals(&[("sticky_session", ON)]);
const PORT: (i64, i64) = (1, 65535);

impl Field {
    const fn new(name: &'static str, param: &'static str, kind: Kind, protocols: &'static [Protocol]) -> Self {
        Self {
            name,
            param,
            kind,
            protocols,
            default: None,
            range: None,
            allowed: &[],
            mode: Mode::Attribute,
            forward: false,
            when: None,
            clearable: false,
        }
    }

    const fn string(name: &'static str, param: &'static str, protocols: &'static [Protocol]) -> Self {
        Self::new(name, param, Kind::Str, protocols)
    }

    const fn int(name: &'static str, param: &'static str, protocols: &'static [Protocol]) -> Self {
        Self::new(name, param, Kind::Int, protocols)
    }

    const fn default(mut self, default: Fallback) -> Self {
        self.default = Some(default);
        self
    }

    const fn range(mut self, min: i64, max: i64) -> Self {
        self.range = Some((min, max));
        self
    }

    const fn allowed(mut self, allowed: &'static [&'static str]) -> Self {
        self.allowed = allowed;
        self
    }

    const fn force_new(mut self) -> Self {
        self.mode = Mode::ForceNew;
        self
    }

    const fn forward(mut self) -> Self {
        self.forward = true;
        self
    }

    const fn when(mut self, condition: Condition) -> Self {
        self.when = Some(condition);
        self
    }

    const fn clearable(mut self) -> Self {
        self.clearable = true;
        self
    }

    fn param(&self, protocol: Protocol) -> &'static str {
        match (self.name, protocol) {
            ("health_check_timeout", Tcp | Udp) => "HealthCheckConnectTimeout",
            _ => self.param,
        }
    }
}

pub static FIELDS: &[Field] = &[
    Field::string("protocol", "", ALL)
        .allowed(&["tcp", "udp", "http", "https"])
        .force_new()
        .forward(),
    Field::string("load_balancer_id", "LoadBalancerId", ALL)
        .force_new()
        .forward(),
    Field::int("frontend_port", "ListenerPort", ALL)
        .range(PORT.0, PORT.1)
        .force_new()
        .forward(),
    Field::int("backend_port", "BackendServerPort", ALL)
        .range(PORT.0, PORT.1)
        .force_new()
        .forward(),
    Field::int("bandwidth", "Bandwidth", ALL)
        .range(-1, 5000)
        .forward(),
    Field::string("scheduler", "Scheduler", ALL)
        .default(Fallback::Str("wrr"))
        .allowed(&["wrr", "wlc", "rr", "sch", "tch", "qch"]),
    Field::string("server_group_id", "VServerGroupId", ALL)
        .forward()
        .clearable(),
    Field::string("master_slave_server_group_id", "MasterSlaveServerGroupId", ALL)
        .forward()
        .clearable(),
    Field::string("acl_status", "AclStatus", ALL)
        .default(Fallback::Str(OFF))
        .allowed(ON_OFF)
        .forward(),
    Field::string("acl_type", "AclType", ALL)
        .allowed(&["black", "white"])
        .forward()
        .when(ACL_ON),
    Field::string("acl_id", "AclId", ALL)
        .forward()
        .when(ACL_ON)
        .clearable(),
    Field::int("health_check_connect_port", "HealthCheckConnectPort", ALL)
        .range(PORT.0, PORT.1)
        .when(Condition::HealthCheck),
    Field::int("healthy_threshold", "HealthyThreshold", ALL)
        .default(Fallback::Int(3))
        .range(1, 10)
        .when(Condition::HealthCheck),
    Field::int("unhealthy_threshold", "UnhealthyThreshold", ALL)
        .default(Fallback::Int(3))
        .range(1, 10)
        .when(Condition::HealthCheck),
    Field::int("health_check_timeout", "HealthCheckTimeout", ALL)
        .default(Fallback::Int(5))
        .range(1, 300)
        .when(Condition::HealthCheck),
    Field::int("health_check_interval", "HealthCheckInterval", ALL)
        .default(Fallback::Int(2))
        .range(1, 50)
        .when(Condition::HealthCheck),
    Field::string("sticky_session", "StickySession", HTTP_FAMILY)
        .default(Fallback::Str(OFF))
        .allowed(ON_OFF)
        .forward(),
    Field::string("sticky_session_type", "StickySessionType", HTTP_FAMILY)
        .allowed(&["insert", "server"])
        .when(STICKY),
    Field::int("cookie_timeout", "CookieTimeout", HTTP_FAMILY)
        .range(1, 86400)
        .when(Condition::Equals(&[("sticky_session", ON), ("sticky_session_type", "insert")])),
    Field::string("cookie", "Cookie", HTTP_FAMILY)
        .when(Condition::Equals(&[("sticky_session", ON), ("sticky_session_type", "server")]))
        .clearable(),
    Field::string("health_check", "HealthCheck", HTTP_FAMILY)
        .default(Fallback::Str(ON))
        .allowed(ON_OFF)
        .forward(),
    Field::new("gzip", "Gzip", Kind::Switch, HTTP_FAMILY).default(Fallback::Bool(true)),
    Field::new("x_forwarded_for", "", Kind::ForwardedFor, HTTP_FAMILY),
    Field::int("idle_timeout", "IdleTimeout", HTTP_FAMILY)
        .default(Fallback::Int(15))
        .range(1, 60),
    Field::int("request_timeout", "RequestTimeout", HTTP_FAMILY)
        .default(Fallback::Int(60))
        .range(1, 180),
    Field::string("health_check_domain", "HealthCheckDomain", HEALTH_URI)
        .when(Condition::HttpProbe)
        .clearable(),
    Field::string("health_check_uri", "HealthCheckURI", HEALTH_URI)
        .default(Fallback::Str("/"))
        .when(Condition::HttpProbe),
    Field::string("health_check_http_code", "HealthCheckHttpCode", HEALTH_URI)
        .default(Fallback::Str("http_2xx"))
        .allowed(&["http_2xx", "http_3xx", "http_4xx", "http_5xx"])
        .when(Condition::HttpProbe),
    Field::string("health_check_type", "HealthCheckType", TCP_ONLY)
        .default(Fallback::Str("tcp"))
        .allowed(&["tcp", "http"]),
    Field::int("established_timeout", "EstablishedTimeout", TCP_ONLY)
        .default(Fallback::Int(900))
        .range(10, 900),
    Field::int("persistence_timeout", "PersistenceTimeout", TCP_UDP)
        .default(Fallback::Int(0))
        .range(0, 3600),
    Field::string("ssl_certificate_id", "ServerCertificateId", HTTPS_ONLY),
    Field::string("enable_http2", "EnableHttp2", HTTPS_ONLY)
        .default(Fallback::Str(ON))
        .allowed(ON_OFF),
    Field::string("tls_cipher_policy", "TLSCipherPolicy", HTTPS_ONLY)
        .default(Fallback::Str("tls_cipher_policy_1_0"))
        .allowed(&[
            "tls_cipher_policy_1_0",
            "tls_cipher_policy_1_1",
            "tls_cipher_policy_1_2",
            "tls_cipher_policy_1_2_strict",
        ]),
    Field::string("listener_forward", "ListenerForward", HTTP_ONLY)
        .allowed(ON_OFF)
        .force_new()
        .forward(),
    Field::int("forward_port", "ForwardPort", HTTP_ONLY)
        .range(PORT.0, PORT.1)
        .force_new()
        .forward(),
];

/// X-Forwarded-For flags, their vendor parameters and whether they can be
/// set. The client address is always forwarded and only reported.
const FORWARDED_FOR: &[(&str, &str, bool)] = &[
    ("retrive_client_ip", "XForwardedFor", false),
    ("retrieve_slb_ip", "XForwardedFor_SLBIP", true),
    ("retrieve_slb_id", "XForwardedFor_SLBID", true),
    ("retrieve_slb_proto", "XForwardedFor_proto", true),
];

fn settable_flags() -> impl Iterator<Item = (&'static str, &'static str)> {
    FORWARDED_FOR
        .iter()
        .filter(|(_, _, settable)| *settable)
        .map(|(flag, param, _)| (*flag, *param))
}

fn flag(flags: &FieldValue, name: &str) -> bool {
    flags
        .as_map()
        .and_then(|f| f.get(name))
        .and_then(FieldValue::as_bool)
        .unwrap_or(false)
}

fn field(name: &str) -> Option<&'static Field> {
    FIELDS.iter().find(|f| f.name == name)
}

fn switch(on: bool) -> String {
    if on { ON } else { OFF }.to_string()
}

/// The desired state as the vendor will see it: unknown fields rejected,
/// fields foreign to the variant or switched off by other settings dropped,
/// schema defaults filled in.
pub fn effective(desired: &DesiredState) -> Result<(Variant, DesiredState)> {
    let variant = Variant::of(desired)?;

    if let Some((name, _)) = desired.iter().find(|(name, _)| field(name).is_none()) {
        return Err(ReconcileError::validation(format!(
            "'{name}': unknown listener field"
        )));
    }

    let mut effective = DesiredState::new();
    for field in FIELDS.iter().filter(|f| variant.applies(f)) {
        let value = match (desired.get(field.name), field.default) {
            (Some(FieldValue::String(s)), None) if s.is_empty() => continue,
            (Some(value), _) => value.clone(),
            // forward mode turns off session and health handling
            (None, Some(_)) if variant.forward => OFF.into(),
            (None, Some(default)) => default.value(),
            (None, None) => continue,
        };
        effective.insert(field.name, normalize(field, value));
    }

    // a condition sees the removals made for fields listed before it
    for field in FIELDS {
        if let Some(condition) = field.when {
            if effective.contains(field.name) && !condition.holds(variant.protocol, &effective) {
                effective.remove(field.name);
            }
        }
    }

    if let Some(FieldValue::Map(xff)) = effective.get("x_forwarded_for") {
        let mut flags: IndexMap<String, FieldValue> = settable_flags()
            .map(|(name, _)| (name.to_string(), FieldValue::Bool(false)))
            .collect();
        // anything else declared is kept for validation to reject
        flags.extend(xff.iter().map(|(k, v)| (k.clone(), v.clone())));
        effective.insert("x_forwarded_for", FieldValue::Map(flags));
    }

    Ok((variant, effective))
}

/// Fields to change so the listener matches `effective`.
///
/// Clearable fields the vendor still reports but that are no longer declared
/// are reset. The X-Forwarded-For flags compare on the settable ones only.
pub fn diff(variant: Variant, effective: &DesiredState, observed: &ObservedState) -> ChangeSet {
    let mut changes = ChangeSet::between(effective, observed);
    changes.retain(|name| {
        match (field(name), effective.get(name), observed.get(name)) {
            (Some(f), Some(want), Some(have)) if f.kind == Kind::ForwardedFor => {
                settable_flags().any(|(flag_name, _)| flag(want, flag_name) != flag(have, flag_name))
            }
            _ => true,
        }
    });

    for field in FIELDS.iter().filter(|f| f.clearable && variant.applies(f)) {
        let active = field
            .when
            .map_or(true, |condition| condition.holds(variant.protocol, effective));
        if active && !effective.contains(field.name) && observed.get_set(field.name).is_some() {
            changes.insert(field.name);
        }
    }
    changes
}

/// Coerce scalars to the field's kind so they compare equal to what the
/// vendor reports. Values that do not convert are left for validation.
fn normalize(field: &Field, value: FieldValue) -> FieldValue {
    match (field.kind, &value) {
        (Kind::Int, FieldValue::String(_)) => value.as_i64().map(FieldValue::Integer).unwrap_or(value),
        (Kind::Switch, FieldValue::String(_)) => value.as_bool().map(FieldValue::Bool).unwrap_or(value),
        (Kind::Str, FieldValue::String(s)) if field.name == "protocol" => s.to_ascii_lowercase().into(),
        _ => value,
    }
}

/// Static and cross-field rules. Runs before any vendor call.
pub fn validate(variant: Variant, desired: &DesiredState) -> Result<()> {
    for name in ["load_balancer_id", "frontend_port"] {
        if desired.get_set(name).is_none() {
            return Err(ReconcileError::validation(format!(
                "'{name}': required field is not set"
            )));
        }
    }

    for (name, value) in desired.iter() {
        if let Some(field) = field(name) {
            validate_value(field, value)?;
        }
    }

    for name in variant.protocol.required_fields() {
        if desired.get_set(name).is_none() {
            return Err(ReconcileError::validation(format!(
                "'{name}': required field is not set when the protocol is '{}'",
                variant.protocol
            )));
        }
    }

    if variant.forward {
        for name in ["sticky_session", "health_check"] {
            if desired.get_str(name) == Some(ON) {
                return Err(ReconcileError::validation(format!(
                    "'{name}': can not be enabled on a forwarding listener"
                )));
            }
        }
    }

    if desired.get_str("sticky_session") == Some(ON) {
        match desired.get_str("sticky_session_type") {
            Some("insert") if desired.get_i64("cookie_timeout").unwrap_or(0) == 0 => {
                return Err(ReconcileError::validation(
                    "'cookie_timeout': required field is not set when the sticky session type is 'insert'",
                ));
            }
            Some("server") if desired.get_set("cookie").is_none() => {
                return Err(ReconcileError::validation(
                    "'cookie': required field is not set when the sticky session type is 'server'",
                ));
            }
            Some(_) => {}
            None => {
                return Err(ReconcileError::validation(
                    "'sticky_session_type': required field is not set when the sticky session is 'on'",
                ));
            }
        }
    }

    Ok(())
}

fn validate_value(field: &Field, value: &FieldValue) -> Result<()> {
    let invalid = |what: String| ReconcileError::validation(format!("'{}': {what}", field.name));

    match field.kind {
        Kind::Int => {
            let i = value
                .as_i64()
                .ok_or_else(|| invalid(format!("expected an integer, got '{value}'")))?;
            if let Some((min, max)) = field.range {
                if i < min || i > max {
                    return Err(invalid(format!("{i} is not within {min}..={max}")));
                }
            }
            if field.name == "bandwidth" && i == 0 {
                return Err(invalid("must be -1 or within 1..=5000".to_string()));
            }
        }
        Kind::Str => {
            let s = value
                .as_str()
                .ok_or_else(|| invalid(format!("expected a string, got '{value}'")))?;
            // the http code field takes a comma separated list
            if !field.allowed.is_empty() && !s.split(',').all(|s| field.allowed.contains(&s)) {
                return Err(invalid(format!(
                    "unsupported value '{s}', expected one of {}",
                    field.allowed.join(", ")
                )));
            }
        }
        Kind::Switch => {
            value
                .as_bool()
                .ok_or_else(|| invalid(format!("expected a boolean, got '{value}'")))?;
        }
        Kind::ForwardedFor => {
            let flags = value
                .as_map()
                .ok_or_else(|| invalid("expected a map of flags".to_string()))?;
            for (flag, value) in flags {
                match FORWARDED_FOR.iter().find(|(name, _, _)| *name == flag.as_str()) {
                    None => return Err(invalid(format!("unknown flag '{flag}'"))),
                    Some((_, _, false)) => {
                        return Err(invalid(format!("'{flag}' is read-only")))
                    }
                    Some(_) => {}
                }
                if value.as_bool().is_none() {
                    return Err(invalid(format!("'{flag}' must be a boolean")));
                }
            }
        }
    }
    Ok(())
}

fn encode(field: &Field, protocol: Protocol, value: &FieldValue, params: &mut Params) {
    match field.kind {
        Kind::Str | Kind::Int => {
            params.insert(field.param(protocol).to_string(), value.to_param());
        }
        Kind::Switch => {
            params.insert(
                field.param(protocol).to_string(),
                switch(value.as_bool().unwrap_or(false)),
            );
        }
        Kind::ForwardedFor => {
            for (name, param) in settable_flags() {
                params.insert(param.to_string(), switch(flag(value, name)));
            }
        }
    }
}

fn decode(field: &Field, protocol: Protocol, listener: &Map<String, Value>) -> Option<FieldValue> {
    match field.kind {
        Kind::Str => listener
            .get(field.param(protocol))
            .and_then(FieldValue::from_vendor)
            .map(|v| match v {
                FieldValue::Integer(i) => FieldValue::String(i.to_string()),
                v => v,
            }),
        Kind::Int => listener
            .get(field.param(protocol))
            .and_then(FieldValue::from_vendor)
            .and_then(|v| v.as_i64())
            .map(FieldValue::Integer),
        Kind::Switch => listener
            .get(field.param(protocol))
            .and_then(Value::as_str)
            .map(|s| FieldValue::Bool(s == ON)),
        Kind::ForwardedFor => {
            let flags: IndexMap<String, FieldValue> = FORWARDED_FOR
                .iter()
                .filter_map(|(flag, param, _)| {
                    listener
                        .get(*param)
                        .and_then(Value::as_str)
                        .map(|s| (flag.to_string(), FieldValue::Bool(s == ON)))
                })
                .collect();
            (!flags.is_empty()).then_some(FieldValue::Map(flags))
        }
    }
}

fn identity_params(identity: &ResourceIdentity, port: u16) -> Params {
    let mut params = Params::new();
    params.insert("LoadBalancerId".into(), identity.parent().to_string());
    params.insert("ListenerPort".into(), port.to_string());
    params
}

/// Vendor request creating the listener.
pub fn create_params(variant: Variant, desired: &DesiredState) -> Params {
    let mut params = Params::new();
    for (name, value) in desired.iter() {
        match field(name) {
            Some(field) if !field.param.is_empty() || field.kind == Kind::ForwardedFor => {
                encode(field, variant.protocol, value, &mut params)
            }
            _ => {}
        }
    }

    if variant.forward {
        params.insert("ListenerForward".into(), ON.into());
        if !params.contains_key("BackendServerPort") {
            params.insert("BackendServerPort".into(), FORWARD_BACKEND_PORT.to_string());
        }
    }
    params
}

/// Vendor request applying `changes` through the attribute endpoint.
pub fn update_params(
    variant: Variant,
    identity: &ResourceIdentity,
    port: u16,
    desired: &DesiredState,
    changes: &ChangeSet,
) -> Params {
    let protocol = variant.protocol;
    let mut params = identity_params(identity, port);

    for name in changes.iter() {
        let field = match field(name) {
            Some(field) => field,
            None => continue,
        };
        match (name, desired.get_set(name)) {
            ("server_group_id", value) => {
                params.insert("VServerGroup".into(), switch(value.is_some()));
                if let Some(value) = value {
                    params.insert("VServerGroupId".into(), value.to_param());
                }
            }
            ("master_slave_server_group_id", value) => {
                params.insert("MasterSlaveServerGroup".into(), switch(value.is_some()));
                if let Some(value) = value {
                    params.insert("MasterSlaveServerGroupId".into(), value.to_param());
                }
            }
            (_, Some(value)) => encode(field, protocol, value, &mut params),
            (_, None) if field.clearable => {
                params.insert(field.param(protocol).to_string(), String::new());
            }
            (_, None) => {}
        }
    }

    // the vendor validates these on every attribute call
    let always: &[&str] = match protocol {
        Http => &["sticky_session", "sticky_session_type", "cookie", "cookie_timeout", "health_check"],
        Https => &[
            "sticky_session",
            "sticky_session_type",
            "cookie",
            "cookie_timeout",
            "health_check",
            "ssl_certificate_id",
        ],
        Tcp | Udp => &[],
    };
    for name in always {
        if let (Some(field), Some(value)) = (field(name), desired.get_set(name)) {
            encode(field, protocol, value, &mut params);
        }
    }
    params
}

/// Flatten a listener description into observed state.
pub fn observe(
    protocol: Protocol,
    identity: &ResourceIdentity,
    listener: &Map<String, Value>,
) -> ObservedState {
    let mut observed = ObservedState::new()
        .with("protocol", protocol.as_str())
        .with("load_balancer_id", identity.parent());

    for field in FIELDS.iter().filter(|f| f.protocols.contains(&protocol)) {
        if field.param.is_empty() && field.kind != Kind::ForwardedFor {
            continue;
        }
        if let Some(value) = decode(field, protocol, listener) {
            observed.insert(field.name, value);
        }
    }

    if let Some(status) = listener.get("Status").and_then(Value::as_str) {
        observed.insert("status", status);
    }
    observed
}

fn listener_protocol(load_balancer: &Value, port: u16) -> Option<Protocol> {
    let listeners = load_balancer
        .get("ListenerPortsAndProtocol")
        .and_then(FieldValue::from_vendor)?;
    listeners.as_list()?.iter().find_map(|entry| {
        let entry = entry.as_map()?;
        let listener_port = entry.get("ListenerPort")?.as_i64()?;
        if listener_port != i64::from(port) {
            return None;
        }
        let protocol = entry.get("ListenerProtocol")?.as_str()?;
        match protocol.parse() {
            Ok(protocol) => Some(protocol),
            Err(_) => {
                log::warn!("Ignoring listener on port {port} with unsupported protocol '{protocol}'");
                None
            }
        }
    })
}

pub struct ListenerController<C> {
    api: Api<C>,
}

impl<C: VendorClient> ListenerController<C> {
    pub fn new(client: C, policy: RetryPolicy) -> Self {
        Self {
            api: Api::new(client, policy, &CODES),
        }
    }

    async fn describe_load_balancer(&self, identity: &ResourceIdentity) -> Result<Option<Value>> {
        let mut params = Params::new();
        params.insert("LoadBalancerId".into(), identity.parent().to_string());
        self.api
            .describe(DESCRIBE_LOAD_BALANCER, &identity.to_string(), &params)
            .await
    }

    async fn wait_for_status(
        &self,
        identity: &ResourceIdentity,
        status: &'static str,
    ) -> Result<Option<ObservedState>> {
        reconciler::wait_for(
            self.api.policy(),
            &format!("listener {status}"),
            identity,
            || self.read(identity),
            reconciler::has_status(status),
        )
        .await
    }

    /// Shared-performance load balancers carry no spec and keep the
    /// default cipher policy.
    async fn check_cipher_policy_update(&self, identity: &ResourceIdentity) -> Result<()> {
        let load_balancer = self.describe_load_balancer(identity).await?.ok_or_else(|| {
            ReconcileError::NotFound {
                action: DESCRIBE_LOAD_BALANCER.to_string(),
                identity: identity.to_string(),
            }
        })?;
        let spec = load_balancer
            .get("LoadBalancerSpec")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if spec.is_empty() {
            return Err(ReconcileError::validation(
                "'tls_cipher_policy': can not be updated when the load balancer instance is shared-performance",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl<C: VendorClient> ResourceController for ListenerController<C> {
    fn kind(&self) -> &'static str {
        KIND
    }

    async fn create(&self, desired: &DesiredState) -> Result<ResourceIdentity> {
        let (variant, desired) = effective(desired)?;
        validate(variant, &desired)?;

        let load_balancer_id = desired.get_str("load_balancer_id").unwrap_or_default();
        let port = desired.get_i64("frontend_port").unwrap_or_default();
        let identity = ResourceIdentity::new(load_balancer_id, port);
        identity.port()?;
        log::info!("Creating {} listener: {identity}", variant.protocol);

        let action = variant.protocol.create_action();
        self.api
            .call(&action, &identity.to_string(), &create_params(variant, &desired))
            .await?;

        Ok(identity)
    }

    async fn activate(
        &self,
        identity: &ResourceIdentity,
        _desired: &DesiredState,
    ) -> Result<ObservedState> {
        let port = identity.port()?;
        let observed = reconciler::wait_for(
            self.api.policy(),
            "listener settled",
            identity,
            || self.read(identity),
            reconciler::has_any_status(&[STOPPED, RUNNING]),
        )
        .await?
        .unwrap_or_default();
        if self.is_active(&observed) {
            return Ok(observed);
        }

        log::info!("Starting listener {identity}");
        self.api
            .call(START_LISTENER, &identity.to_string(), &identity_params(identity, port))
            .await?;
        self.wait_for_status(identity, RUNNING)
            .await?
            .ok_or_else(|| ReconcileError::NotFound {
                action: START_LISTENER.to_string(),
                identity: identity.to_string(),
            })
    }

    fn is_active(&self, observed: &ObservedState) -> bool {
        reconciler::has_status(RUNNING)(Some(observed))
    }

    async fn read(&self, identity: &ResourceIdentity) -> Result<Option<ObservedState>> {
        let port = identity.port()?;

        let load_balancer = match self.describe_load_balancer(identity).await? {
            Some(load_balancer) => load_balancer,
            None => return Ok(None),
        };
        let protocol = match listener_protocol(&load_balancer, port) {
            Some(protocol) => protocol,
            None => return Ok(None),
        };

        let listener = self
            .api
            .describe(
                &protocol.describe_action(),
                &identity.to_string(),
                &identity_params(identity, port),
            )
            .await?;
        let listener = match listener {
            Some(Value::Object(listener)) => listener,
            _ => return Ok(None),
        };

        let listener_port = listener
            .get("ListenerPort")
            .and_then(FieldValue::from_vendor)
            .and_then(|p| p.as_i64())
            .unwrap_or(0);
        if listener_port <= 0 {
            return Ok(None);
        }

        Ok(Some(observe(protocol, identity, &listener)))
    }

    async fn update(
        &self,
        identity: &ResourceIdentity,
        desired: &DesiredState,
        observed: &ObservedState,
    ) -> Result<Option<ObservedState>> {
        let (variant, effective) = effective(desired)?;
        validate(variant, &effective)?;

        let changes = diff(variant, &effective, observed);
        if changes.is_empty() {
            log::debug!("Listener {identity} is up to date");
            return Ok(Some(observed.clone()));
        }
        if self.requires_replacement(&changes) {
            return Err(ReconcileError::validation(format!(
                "listener {identity}: {changes} can not be changed in place"
            )));
        }
        if changes.contains("tls_cipher_policy") {
            self.check_cipher_policy_update(identity).await?;
        }

        let port = identity.port()?;
        log::info!("Updating listener {identity}: {changes}");
        let params = update_params(variant, identity, port, &effective, &changes);
        self.api
            .call(&variant.protocol.update_action(), &identity.to_string(), &params)
            .await?;

        self.read(identity).await
    }

    async fn delete(&self, identity: &ResourceIdentity) -> Result<()> {
        let port = identity.port()?;
        log::info!("Deleting listener {identity}");

        if !self
            .api
            .remove(DELETE_LISTENER, &identity.to_string(), &identity_params(identity, port))
            .await?
        {
            log::info!("Listener {identity} already gone");
        }

        reconciler::wait_for(
            self.api.policy(),
            "listener deleted",
            identity,
            || self.read(identity),
            reconciler::is_absent,
        )
        .await
        .map(|_| ())
    }

    fn changes(&self, desired: &DesiredState, observed: &ObservedState) -> Result<ChangeSet> {
        let (variant, effective) = effective(desired)?;
        Ok(diff(variant, &effective, observed))
    }

    fn requires_replacement(&self, changes: &ChangeSet) -> bool {
        changes
            .iter()
            .filter_map(field)
            .any(|f| f.mode == Mode::ForceNew)
    }

    fn backfill(&self, observed: &ObservedState) -> DesiredState {
        observed
            .iter()
            .filter(|(name, _)| field(name).is_some())
            .map(|(name, value)| match value {
                FieldValue::Map(flags) if name.as_str() == "x_forwarded_for" => {
                    let settable = flags
                        .iter()
                        .filter(|(flag, _)| settable_flags().any(|(known, _)| known == flag.as_str()))
                        .map(|(flag, value)| (flag.clone(), value.clone()))
                        .collect();
                    (name.clone(), FieldValue::Map(settable))
                }
                _ => (name.clone(), value.clone()),
            })
            .collect()
    }
}
