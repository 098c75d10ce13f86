use std::ops::RangeInclusive;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sea_orm::sea_query::{Condition, Expr};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::db::entities::{firewall_rule, server};
use crate::db::enums::{FirewallAction, FirewallDirection, FirewallProtocol};
use crate::db::services::job_handlers::{FIREWALL_APPLY, FIREWALL_REVERT};
use crate::db::services::job_service::{JobQueue, insert_job};
use crate::events::{EventBus, FleetEvent};
use crate::state::FirewallState;

pub const ROLLBACK_REASON_TIMEOUT: &str = "confirmation timeout";
pub const ROLLBACK_REASON_OPERATOR: &str = "reverted by operator";

#[derive(Debug, thiserror::Error)]
pub enum FirewallError {
    #[error("Database error: {0}")]
    DbErr(#[from] DbErr),
    #[error("Firewall rule {0} not found")]
    NotFound(i32),
    #[error("Server {0} not found")]
    ServerNotFound(i32),
    #[error("Unknown confirmation token")]
    UnknownToken,
    #[error("Firewall rule was already confirmed")]
    AlreadyConfirmed,
    #[error("Confirmation window has expired")]
    Expired,
    #[error("Firewall rule was already rolled back")]
    RolledBack,
    #[error("Firewall rule {0} is a system rule and cannot be changed")]
    SystemRule(i32),
    #[error("Invalid port specification: {0}")]
    InvalidPort(String),
    #[error("Firewall rule {rule_id} cannot be {action} while {state:?}")]
    InvalidState {
        rule_id: i32,
        action: &'static str,
        state: FirewallState,
    },
}

/// Ports a rule applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSet {
    All,
    Ranges(Vec<RangeInclusive<u16>>),
}

impl PortSet {
    pub fn contains(&self, port: u16) -> bool {
        match self {
            PortSet::All => true,
            PortSet::Ranges(ranges) => ranges.iter().any(|r| r.contains(&port)),
        }
    }

    pub fn intersects(&self, ports: &[u16]) -> bool {
        ports.iter().any(|p| self.contains(*p))
    }
}

/// Parses `22`, `8000:8100`, or a comma-separated list of either. Empty or
/// missing means every port.
pub fn parse_ports(spec: Option<&str>) -> Result<PortSet, FirewallError> {
    let Some(spec) = spec.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(PortSet::All);
    };
    if spec.eq_ignore_ascii_case("any") {
        return Ok(PortSet::All);
    }

    let parse_one = |raw: &str| -> Result<u16, FirewallError> {
        match raw.trim().parse::<u16>() {
            Ok(0) | Err(_) => Err(FirewallError::InvalidPort(spec.to_string())),
            Ok(port) => Ok(port),
        }
    };

    let mut ranges = Vec::new();
    for part in spec.split(',') {
        let range = match part.split_once(':') {
            Some((from, to)) => {
                let (from, to) = (parse_one(from)?, parse_one(to)?);
                if from > to {
                    return Err(FirewallError::InvalidPort(spec.to_string()));
                }
                from..=to
            }
            None => {
                let port = parse_one(part)?;
                port..=port
            }
        };
        ranges.push(range);
    }
    Ok(PortSet::Ranges(ranges))
}

/// Ports that must stay reachable for the control plane to manage a server.
pub fn management_ports(configured: &[u16], server: &server::Model) -> Vec<u16> {
    let mut ports: Vec<u16> = configured.to_vec();
    let own = [Some(server.ssh_port), server.agent_port];
    ports.extend(own.into_iter().flatten().filter_map(|p| u16::try_from(p).ok()));
    ports.sort_unstable();
    ports.dedup();
    ports
}

fn scoped_source(source_ip: Option<&str>) -> bool {
    match source_ip.map(str::trim) {
        None | Some("") => false,
        Some(src) => !matches!(src.to_ascii_lowercase().as_str(), "any" | "0.0.0.0/0" | "::/0"),
    }
}

/// Whether applying the rule could lock the control plane out of the server.
///
/// Critical rules are: inbound blocks touching a management port (or all ports),
/// inbound allows that restrict a management port to a source, and outbound
/// blocks on all ports. UDP-only rules never cut management traffic.
pub fn is_critical(
    action: FirewallAction,
    direction: FirewallDirection,
    protocol: FirewallProtocol,
    ports: &PortSet,
    source_ip: Option<&str>,
    management: &[u16],
) -> bool {
    if protocol == FirewallProtocol::Udp {
        return false;
    }
    match direction {
        FirewallDirection::In if action.is_blocking() => ports.intersects(management),
        FirewallDirection::In => scoped_source(source_ip) && ports.intersects(management),
        FirewallDirection::Out => action.is_blocking() && *ports == PortSet::All,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewFirewallRule {
    pub name: String,
    pub action: FirewallAction,
    pub direction: FirewallDirection,
    pub protocol: FirewallProtocol,
    pub port: Option<String>,
    pub source_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    Applied {
        rule: firewall_rule::Model,
        job_id: i32,
    },
    RequiresConfirmation {
        rule: firewall_rule::Model,
        job_id: i32,
        token: String,
        timeout_secs: i64,
        expires_at: DateTime<Utc>,
        confirm_url: String,
    },
}

#[derive(Debug, Clone)]
pub struct FirewallSettings {
    pub confirmation_timeout_secs: i64,
    pub critical_ports: Vec<u16>,
    pub saas_url: String,
}

fn rule_payload(rule: &firewall_rule::Model) -> serde_json::Value {
    json!({
        "rule_id": rule.id,
        "action": rule.action,
        "direction": rule.direction,
        "protocol": rule.protocol,
        "port": rule.port,
        "source_ip": rule.source_ip,
    })
}

/// Applies firewall rules, holding back the dangerous ones behind an explicit
/// confirmation that expires into an automatic revert.
#[derive(Clone)]
pub struct FirewallController {
    db: Arc<DatabaseConnection>,
    jobs: JobQueue,
    events: EventBus,
    settings: FirewallSettings,
}

impl FirewallController {
    pub fn new(db: Arc<DatabaseConnection>, jobs: JobQueue, events: EventBus, settings: FirewallSettings) -> Self {
        Self {
            db,
            jobs,
            events,
            settings,
        }
    }

    pub async fn get(&self, rule_id: i32) -> Result<firewall_rule::Model, FirewallError> {
        firewall_rule::Entity::find_by_id(rule_id)
            .one(self.db.as_ref())
            .await?
            .ok_or(FirewallError::NotFound(rule_id))
    }

    async fn server(&self, server_id: i32) -> Result<server::Model, FirewallError> {
        server::Entity::find_by_id(server_id)
            .one(self.db.as_ref())
            .await?
            .ok_or(FirewallError::ServerNotFound(server_id))
    }

    /// Stores a rule without applying it.
    pub async fn create_rule(&self, server_id: i32, new: NewFirewallRule) -> Result<firewall_rule::Model, FirewallError> {
        parse_ports(new.port.as_deref())?;
        self.server(server_id).await?;
        let now = Utc::now();
        let rule = firewall_rule::ActiveModel {
            server_id: Set(server_id),
            name: Set(new.name),
            action: Set(new.action),
            direction: Set(new.direction),
            protocol: Set(new.protocol),
            port: Set(new.port.filter(|p| !p.trim().is_empty())),
            source_ip: Set(new.source_ip.filter(|s| !s.trim().is_empty())),
            is_active: Set(false),
            is_system: Set(false),
            is_pending_confirmation: Set(false),
            confirmation_token: Set(None),
            confirmation_expires_at: Set(None),
            confirmed_at: Set(None),
            rollback_reason: Set(None),
            rolled_back_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(self.db.as_ref())
        .await?;
        debug!(rule_id = rule.id, server_id, "Firewall rule created.");
        Ok(rule)
    }

    /// Creates the SSH, HTTP and HTTPS allow rules every server starts with.
    /// Already present system rules are left alone.
    pub async fn seed_system_rules(&self, server_id: i32) -> Result<Vec<firewall_rule::Model>, FirewallError> {
        let srv = self.server(server_id).await?;
        let existing = firewall_rule::Entity::find()
            .filter(firewall_rule::Column::ServerId.eq(server_id))
            .filter(firewall_rule::Column::IsSystem.eq(true))
            .all(self.db.as_ref())
            .await?;

        let now = Utc::now();
        let mut created = Vec::new();
        for (name, port) in [("SSH", srv.ssh_port.to_string()), ("HTTP", "80".into()), ("HTTPS", "443".into())] {
            if existing.iter().any(|r| r.port.as_deref() == Some(port.as_str())) {
                continue;
            }
            let rule = firewall_rule::ActiveModel {
                server_id: Set(server_id),
                name: Set(name.to_string()),
                action: Set(FirewallAction::Allow),
                direction: Set(FirewallDirection::In),
                protocol: Set(FirewallProtocol::Tcp),
                port: Set(Some(port)),
                source_ip: Set(None),
                is_active: Set(true),
                is_system: Set(true),
                is_pending_confirmation: Set(false),
                confirmation_token: Set(None),
                confirmation_expires_at: Set(None),
                confirmed_at: Set(None),
                rollback_reason: Set(None),
                rolled_back_at: Set(None),
                created_at: Set(now),
                updated_at: Set(now),
                ..Default::default()
            }
            .insert(self.db.as_ref())
            .await?;
            created.push(rule);
        }
        info!(server_id, created = created.len(), "System firewall rules seeded.");
        Ok(created)
    }

    /// Classifies a stored rule against its server's management ports.
    pub async fn classify(&self, rule: &firewall_rule::Model) -> Result<bool, FirewallError> {
        let srv = self.server(rule.server_id).await?;
        let ports = parse_ports(rule.port.as_deref())?;
        let management = management_ports(&self.settings.critical_ports, &srv);
        Ok(is_critical(
            rule.action,
            rule.direction,
            rule.protocol,
            &ports,
            rule.source_ip.as_deref(),
            &management,
        ))
    }

    pub async fn apply_with_safety(&self, rule_id: i32) -> Result<ApplyOutcome, FirewallError> {
        self.apply_with_safety_at(rule_id, Utc::now()).await
    }

    /// Sends the rule to the agent. Critical rules stay pending until confirmed
    /// and are reverted automatically once the window closes.
    pub async fn apply_with_safety_at(&self, rule_id: i32, now: DateTime<Utc>) -> Result<ApplyOutcome, FirewallError> {
        let rule = self.get(rule_id).await?;
        if rule.is_system {
            return Err(FirewallError::SystemRule(rule_id));
        }
        let state = FirewallState::of(&rule);
        if !state.can_apply() {
            return Err(FirewallError::InvalidState {
                rule_id,
                action: "applied",
                state,
            });
        }

        let critical = self.classify(&rule).await?;
        let timeout_secs = self.settings.confirmation_timeout_secs.max(1);
        let expires_at = now + Duration::seconds(timeout_secs);
        let token = critical.then(|| hex::encode(rand::random::<[u8; 32]>()));

        let txn = self.db.begin().await?;
        let written = firewall_rule::Entity::update_many()
            .col_expr(firewall_rule::Column::IsActive, Expr::value(true))
            .col_expr(firewall_rule::Column::IsPendingConfirmation, Expr::value(critical))
            .col_expr(firewall_rule::Column::ConfirmationToken, Expr::value(token.clone()))
            .col_expr(
                firewall_rule::Column::ConfirmationExpiresAt,
                Expr::value(critical.then_some(expires_at)),
            )
            .col_expr(firewall_rule::Column::ConfirmedAt, Expr::value(Option::<DateTime<Utc>>::None))
            .col_expr(firewall_rule::Column::RollbackReason, Expr::value(Option::<String>::None))
            .col_expr(firewall_rule::Column::RolledBackAt, Expr::value(Option::<DateTime<Utc>>::None))
            .col_expr(firewall_rule::Column::UpdatedAt, Expr::value(now))
            .filter(firewall_rule::Column::Id.eq(rule_id))
            .filter(firewall_rule::Column::IsActive.eq(false))
            .filter(firewall_rule::Column::IsPendingConfirmation.eq(false))
            .exec(&txn)
            .await?;
        if written.rows_affected == 0 {
            txn.rollback().await?;
            let latest = self.get(rule_id).await?;
            return Err(FirewallError::InvalidState {
                rule_id,
                action: "applied",
                state: FirewallState::of(&latest),
            });
        }
        let job = insert_job(
            &txn,
            rule.server_id,
            FIREWALL_APPLY,
            rule_payload(&rule),
            self.jobs.default_priority(),
            now,
        )
        .await?;
        txn.commit().await?;
        self.jobs.announce_created(&job);

        let rule = self.get(rule_id).await?;
        match token {
            None => {
                info!(rule_id, server_id = rule.server_id, job_id = job.id, "Firewall rule applied.");
                Ok(ApplyOutcome::Applied { rule, job_id: job.id })
            }
            Some(token) => {
                warn!(
                    rule_id,
                    server_id = rule.server_id,
                    %expires_at,
                    "Critical firewall rule applied; awaiting confirmation."
                );
                let confirm_url = format!(
                    "{}/firewall/confirm/{token}",
                    self.settings.saas_url.trim_end_matches('/')
                );
                Ok(ApplyOutcome::RequiresConfirmation {
                    rule,
                    job_id: job.id,
                    token,
                    timeout_secs,
                    expires_at,
                    confirm_url,
                })
            }
        }
    }

    pub async fn confirm(&self, token: &str) -> Result<firewall_rule::Model, FirewallError> {
        self.confirm_at(token, Utc::now()).await
    }

    /// Keeps a pending rule. Only succeeds while the window is open; every other
    /// case is reported as a distinct error.
    pub async fn confirm_at(&self, token: &str, now: DateTime<Utc>) -> Result<firewall_rule::Model, FirewallError> {
        let rule = firewall_rule::Entity::find()
            .filter(firewall_rule::Column::ConfirmationToken.eq(token))
            .one(self.db.as_ref())
            .await?
            .ok_or(FirewallError::UnknownToken)?;

        let written = firewall_rule::Entity::update_many()
            .col_expr(firewall_rule::Column::IsPendingConfirmation, Expr::value(false))
            .col_expr(firewall_rule::Column::ConfirmedAt, Expr::value(now))
            .col_expr(firewall_rule::Column::UpdatedAt, Expr::value(now))
            .filter(firewall_rule::Column::Id.eq(rule.id))
            .filter(firewall_rule::Column::IsPendingConfirmation.eq(true))
            .filter(firewall_rule::Column::ConfirmationExpiresAt.gte(now))
            .exec(self.db.as_ref())
            .await?;

        let latest = self.get(rule.id).await?;
        if written.rows_affected == 1 {
            info!(rule_id = latest.id, server_id = latest.server_id, "Firewall rule confirmed.");
            return Ok(latest);
        }

        if latest.rolled_back_at.is_some() {
            Err(FirewallError::RolledBack)
        } else if latest.confirmed_at.is_some() {
            Err(FirewallError::AlreadyConfirmed)
        } else {
            Err(FirewallError::Expired)
        }
    }

    pub async fn rollback_expired_rules(&self) -> Result<Vec<firewall_rule::Model>, FirewallError> {
        self.rollback_expired_rules_at(None, Utc::now()).await
    }

    /// Reverts every pending rule whose confirmation window has closed.
    pub async fn rollback_expired_rules_at(
        &self,
        only_rule: Option<i32>,
        now: DateTime<Utc>,
    ) -> Result<Vec<firewall_rule::Model>, FirewallError> {
        let mut query = firewall_rule::Entity::find().filter(expired_condition(now));
        if let Some(id) = only_rule {
            query = query.filter(firewall_rule::Column::Id.eq(id));
        }
        let expired = query.all(self.db.as_ref()).await?;

        let mut rolled_back = Vec::new();
        for rule in expired {
            let txn = self.db.begin().await?;
            let written = firewall_rule::Entity::update_many()
                .col_expr(firewall_rule::Column::IsPendingConfirmation, Expr::value(false))
                .col_expr(firewall_rule::Column::IsActive, Expr::value(false))
                .col_expr(firewall_rule::Column::RolledBackAt, Expr::value(now))
                .col_expr(firewall_rule::Column::RollbackReason, Expr::value(ROLLBACK_REASON_TIMEOUT))
                .col_expr(firewall_rule::Column::UpdatedAt, Expr::value(now))
                .filter(firewall_rule::Column::Id.eq(rule.id))
                .filter(expired_condition(now))
                .exec(&txn)
                .await?;
            if written.rows_affected == 0 {
                txn.rollback().await?;
                debug!(rule_id = rule.id, "Rule confirmed or reverted concurrently; skipping rollback.");
                continue;
            }
            let job = insert_job(
                &txn,
                rule.server_id,
                FIREWALL_REVERT,
                rule_payload(&rule),
                self.jobs.default_priority(),
                now,
            )
            .await?;
            txn.commit().await?;
            self.jobs.announce_created(&job);

            warn!(
                rule_id = rule.id,
                server_id = rule.server_id,
                expired_at = ?rule.confirmation_expires_at,
                "Firewall rule rolled back after confirmation timeout."
            );
            self.events.emit(FleetEvent::FirewallRuleRolledBack {
                rule_id: rule.id,
                server_id: rule.server_id,
                reason: ROLLBACK_REASON_TIMEOUT.to_string(),
            });
            rolled_back.push(self.get(rule.id).await?);
        }
        Ok(rolled_back)
    }

    pub async fn revert(&self, rule_id: i32) -> Result<firewall_rule::Model, FirewallError> {
        self.revert_at(rule_id, Utc::now()).await
    }

    /// Operator-initiated deactivation of an active or pending rule.
    pub async fn revert_at(&self, rule_id: i32, now: DateTime<Utc>) -> Result<firewall_rule::Model, FirewallError> {
        let rule = self.get(rule_id).await?;
        if rule.is_system {
            return Err(FirewallError::SystemRule(rule_id));
        }
        let state = FirewallState::of(&rule);
        if !state.can_revert() {
            return Err(FirewallError::InvalidState {
                rule_id,
                action: "reverted",
                state,
            });
        }

        let txn = self.db.begin().await?;
        let written = firewall_rule::Entity::update_many()
            .col_expr(firewall_rule::Column::IsPendingConfirmation, Expr::value(false))
            .col_expr(firewall_rule::Column::IsActive, Expr::value(false))
            .col_expr(firewall_rule::Column::RolledBackAt, Expr::value(now))
            .col_expr(firewall_rule::Column::RollbackReason, Expr::value(ROLLBACK_REASON_OPERATOR))
            .col_expr(firewall_rule::Column::UpdatedAt, Expr::value(now))
            .filter(firewall_rule::Column::Id.eq(rule_id))
            .filter(
                Condition::any()
                    .add(firewall_rule::Column::IsActive.eq(true))
                    .add(firewall_rule::Column::IsPendingConfirmation.eq(true)),
            )
            .exec(&txn)
            .await?;
        if written.rows_affected == 0 {
            txn.rollback().await?;
            let latest = self.get(rule_id).await?;
            return Err(FirewallError::InvalidState {
                rule_id,
                action: "reverted",
                state: FirewallState::of(&latest),
            });
        }
        let job = insert_job(
            &txn,
            rule.server_id,
            FIREWALL_REVERT,
            rule_payload(&rule),
            self.jobs.default_priority(),
            now,
        )
        .await?;
        txn.commit().await?;
        self.jobs.announce_created(&job);

        info!(rule_id, server_id = rule.server_id, job_id = job.id, "Firewall rule reverted by operator.");
        self.get(rule_id).await
    }
}

fn expired_condition(now: DateTime<Utc>) -> Condition {
    Condition::all()
        .add(firewall_rule::Column::IsPendingConfirmation.eq(true))
        .add(firewall_rule::Column::ConfirmationExpiresAt.lt(now))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MGMT: &[u16] = &[22, 8443];

    fn critical(
        action: FirewallAction,
        direction: FirewallDirection,
        protocol: FirewallProtocol,
        port: Option<&str>,
        source: Option<&str>,
    ) -> bool {
        is_critical(action, direction, protocol, &parse_ports(port).unwrap(), source, MGMT)
    }

    #[test]
    fn port_specs_parse() {
        assert_eq!(parse_ports(None).unwrap(), PortSet::All);
        assert_eq!(parse_ports(Some("  ")).unwrap(), PortSet::All);
        assert_eq!(parse_ports(Some("22")).unwrap(), PortSet::Ranges(vec![22..=22]));
        assert_eq!(
            parse_ports(Some("80,8000:8100")).unwrap(),
            PortSet::Ranges(vec![80..=80, 8000..=8100])
        );
        assert!(parse_ports(Some("0")).is_err());
        assert!(parse_ports(Some("70000")).is_err());
        assert!(parse_ports(Some("100:10")).is_err());
        assert!(parse_ports(Some("ssh")).is_err());
    }

    #[test]
    fn inbound_block_on_management_port_is_critical() {
        use FirewallAction::*;
        use FirewallDirection::*;
        use FirewallProtocol::*;
        assert!(critical(Deny, In, Tcp, Some("22"), None));
        assert!(critical(Reject, In, Any, Some("20:30"), None));
        assert!(critical(Limit, In, Tcp, Some("8443"), None));
        assert!(critical(Deny, In, Tcp, None, None));
        assert!(!critical(Deny, In, Tcp, Some("3306"), None));
    }

    #[test]
    fn source_scoped_allow_on_management_port_is_critical() {
        use FirewallAction::*;
        use FirewallDirection::*;
        use FirewallProtocol::*;
        assert!(critical(Allow, In, Tcp, Some("22"), Some("203.0.113.7")));
        assert!(!critical(Allow, In, Tcp, Some("22"), None));
        assert!(!critical(Allow, In, Tcp, Some("22"), Some("any")));
        assert!(!critical(Allow, In, Tcp, Some("80"), Some("203.0.113.7")));
    }

    #[test]
    fn outbound_block_on_all_ports_is_critical() {
        use FirewallAction::*;
        use FirewallDirection::*;
        use FirewallProtocol::*;
        assert!(critical(Deny, Out, Any, None, None));
        assert!(!critical(Deny, Out, Tcp, Some("25"), None));
        assert!(!critical(Allow, Out, Any, None, None));
    }

    #[test]
    fn udp_rules_are_never_critical() {
        assert!(!critical(
            FirewallAction::Deny,
            FirewallDirection::In,
            FirewallProtocol::Udp,
            Some("22"),
            None
        ));
    }
}
