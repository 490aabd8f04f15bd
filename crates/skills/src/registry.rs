//! The skill registry: catalog of tools, permission metadata, and the
//! routed execution pipeline.
//!
//! Execution never raises: every path ends in a [`ToolOutput`] whose
//! content is safe to show a user. Crashing skills are classified,
//! recorded in the error store, and counted against skill health.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use coda_domain::tool::ToolDefinition;
use coda_domain::{ClassifiedError, Error, ErrorCategory, Result};

use crate::errors::ClassifiedErrorStore;
use crate::executor::{run_resilient, RetryPolicy};
use crate::health::{Admission, HealthTracker};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Skill trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A tool-providing module.
///
/// Contract: any content in a tool result that originated off-device
/// must already be wrapped with `coda_domain::sanitize` before it is
/// returned from [`execute`](Skill::execute).
#[async_trait]
pub trait Skill: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// The tools this skill owns.
    fn tools(&self) -> Vec<ToolDefinition>;

    /// Config keys that must be present at registration.
    fn required_config(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Execute one of this skill's tools.
    async fn execute(&self, tool: &str, input: &Value) -> Result<String>;

    /// Lifecycle hooks.
    async fn start(&self) -> Result<()> {
        Ok(())
    }
    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Periodic chance to release idle external resources (browser
    /// sessions, sockets). Called from a background sweep.
    async fn release_idle(&self) -> Result<()> {
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Filters and outputs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Catalog filter used when listing tools for a caller.
#[derive(Debug, Clone, Default)]
pub struct ToolFilter {
    /// Restrict to tools owned by these skills.
    pub allowed_skills: Option<HashSet<String>>,
    /// Restrict to these tool names.
    pub allowed_tools: Option<HashSet<String>>,
    pub blocked_tools: HashSet<String>,
    /// Hide tools flagged `main_agent_only` (used for subagent catalogs).
    pub exclude_main_agent_only: bool,
}

impl ToolFilter {
    /// No filtering: the full catalog.
    pub fn all() -> Self {
        Self::default()
    }

    /// The filter a subagent run sees: no privileged tools, intersected
    /// with its allow list, minus its block list.
    pub fn for_subagent(allowed: Option<&[String]>, blocked: &[String]) -> Self {
        Self {
            allowed_skills: None,
            allowed_tools: allowed.map(|names| names.iter().cloned().collect()),
            blocked_tools: blocked.iter().cloned().collect(),
            exclude_main_agent_only: true,
        }
    }

    fn permits(&self, skill: &str, def: &ToolDefinition) -> bool {
        if self.exclude_main_agent_only && def.main_agent_only {
            return false;
        }
        if self.blocked_tools.contains(&def.name) {
            return false;
        }
        if let Some(skills) = &self.allowed_skills {
            if !skills.contains(skill) {
                return false;
            }
        }
        if let Some(tools) = &self.allowed_tools {
            if !tools.contains(&def.name) {
                return false;
            }
        }
        true
    }
}

/// Result of a routed tool execution. Never an exception.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    fn ok(content: String) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    fn err(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SkillRegistry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct RegisteredSkill {
    skill: Arc<dyn Skill>,
    #[allow(dead_code)]
    config: HashMap<String, String>,
}

struct ToolEntry {
    skill: String,
    def: ToolDefinition,
}

const TOOL_EXEC_POLICY: RetryPolicy = RetryPolicy {
    timeout: std::time::Duration::from_secs(30),
    retries: 2,
};

pub struct SkillRegistry {
    skills: RwLock<HashMap<String, RegisteredSkill>>,
    tools: RwLock<HashMap<String, ToolEntry>>,
    health: Arc<HealthTracker>,
    errors: Arc<ClassifiedErrorStore>,
}

impl SkillRegistry {
    pub fn new(health: Arc<HealthTracker>, errors: Arc<ClassifiedErrorStore>) -> Self {
        Self {
            skills: RwLock::new(HashMap::new()),
            tools: RwLock::new(HashMap::new()),
            health,
            errors,
        }
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub fn errors(&self) -> &Arc<ClassifiedErrorStore> {
        &self.errors
    }

    /// Register a skill and its tools.
    ///
    /// Fails when a required config key is missing or any tool name
    /// collides with an already-registered tool; on failure nothing is
    /// registered and the skill is not started.
    pub async fn register(
        &self,
        skill: Arc<dyn Skill>,
        config: HashMap<String, String>,
    ) -> Result<()> {
        let name = skill.name().to_string();

        for key in skill.required_config() {
            if !config.contains_key(key) {
                return Err(Error::Config(format!(
                    "skill {name} missing required config key \"{key}\""
                )));
            }
        }

        let defs = skill.tools();
        {
            let tools = self.tools.read();
            for def in &defs {
                if let Some(existing) = tools.get(&def.name) {
                    return Err(Error::InvalidInput(format!(
                        "tool \"{}\" already registered by skill \"{}\"",
                        def.name, existing.skill
                    )));
                }
            }
            if self.skills.read().contains_key(&name) {
                return Err(Error::InvalidInput(format!(
                    "skill \"{name}\" already registered"
                )));
            }
        }

        skill.start().await?;

        {
            let mut tools = self.tools.write();
            for def in defs {
                tools.insert(
                    def.name.clone(),
                    ToolEntry {
                        skill: name.clone(),
                        def,
                    },
                );
            }
        }
        self.skills
            .write()
            .insert(name.clone(), RegisteredSkill { skill, config });

        tracing::info!(skill = %name, "skill registered");
        Ok(())
    }

    /// Give every skill a chance to release idle external resources.
    pub async fn sweep_idle(&self) {
        let skills: Vec<Arc<dyn Skill>> = self
            .skills
            .read()
            .values()
            .map(|r| r.skill.clone())
            .collect();
        for skill in skills {
            if let Err(e) = skill.release_idle().await {
                tracing::warn!(skill = skill.name(), error = %e, "idle sweep failed");
            }
        }
    }

    /// Stop every registered skill. Failures are logged, not raised.
    pub async fn shutdown(&self) {
        let skills: Vec<Arc<dyn Skill>> = self
            .skills
            .read()
            .values()
            .map(|r| r.skill.clone())
            .collect();
        for skill in skills {
            if let Err(e) = skill.stop().await {
                tracing::warn!(skill = skill.name(), error = %e, "skill stop failed");
            }
        }
    }

    /// The flattened tool catalog after filtering, sorted by name.
    pub fn list_tools(&self, filter: &ToolFilter) -> Vec<ToolDefinition> {
        let tools = self.tools.read();
        let mut defs: Vec<ToolDefinition> = tools
            .values()
            .filter(|entry| filter.permits(&entry.skill, &entry.def))
            .map(|entry| entry.def.clone())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn get_tool(&self, name: &str) -> Option<ToolDefinition> {
        self.tools.read().get(name).map(|e| e.def.clone())
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    /// Which skill owns a tool.
    pub fn owner_of(&self, name: &str) -> Option<String> {
        self.tools.read().get(name).map(|e| e.skill.clone())
    }

    /// Whether executing this tool demands a confirmation token.
    pub fn requires_confirmation(&self, name: &str) -> bool {
        self.tools
            .read()
            .get(name)
            .is_some_and(|e| e.def.requires_confirmation)
    }

    /// Execute a tool through the resilience pipeline.
    pub async fn execute_tool(&self, name: &str, input: &Value) -> ToolOutput {
        let (skill_name, skill) = {
            let tools = self.tools.read();
            let Some(entry) = tools.get(name) else {
                return ToolOutput::err(format!("Unknown tool: \"{name}\""));
            };
            let skills = self.skills.read();
            let Some(registered) = skills.get(&entry.skill) else {
                return ToolOutput::err(format!("Unknown tool: \"{name}\""));
            };
            (entry.skill.clone(), registered.skill.clone())
        };

        match self.health.admit(&skill_name) {
            Admission::Deny { retry_in_ms } => {
                return ToolOutput::err(format!(
                    "Skill \"{skill_name}\" is temporarily unavailable. Retry in about {}s.",
                    retry_in_ms.div_ceil(1000).max(1)
                ));
            }
            Admission::Probe => {
                tracing::info!(skill = %skill_name, tool = name, "recovery probe");
            }
            Admission::Allow => {}
        }

        let result = run_resilient(name, &TOOL_EXEC_POLICY, || skill.execute(name, input)).await;

        match result {
            Ok(content) => {
                self.health.record_success(&skill_name);
                ToolOutput::ok(content)
            }
            Err(e) => {
                let classified = ClassifiedError::from_error(&skill_name, &e);
                let category = classified.category;
                self.errors.push(classified);
                self.health.record_failure(&skill_name);
                tracing::warn!(
                    skill = %skill_name,
                    tool = name,
                    error = %e,
                    category = category.as_str(),
                    "tool execution failed"
                );
                ToolOutput::err(user_facing_failure(name, category, &e))
            }
        }
    }
}

/// Build the user-visible failure string. Keeps the classified message
/// but never internal detail beyond it.
fn user_facing_failure(tool: &str, category: ErrorCategory, error: &Error) -> String {
    match category {
        ErrorCategory::Transient => {
            format!("Tool \"{tool}\" is temporarily unavailable. Please try again shortly.")
        }
        ErrorCategory::RateLimited => {
            format!("Tool \"{tool}\" is rate limited right now. Please try again later.")
        }
        ErrorCategory::AuthExpired => {
            format!("Tool \"{tool}\" needs its credentials refreshed before it can run.")
        }
        _ => format!("Tool \"{tool}\" failed: {error}"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use coda_domain::config::HealthConfig;

    struct TestSkill {
        name: String,
        tools: Vec<ToolDefinition>,
        required: Vec<&'static str>,
        fail: AtomicBool,
        calls: AtomicU32,
    }

    impl TestSkill {
        fn new(name: &str, tool_names: &[&str]) -> Self {
            Self {
                name: name.to_string(),
                tools: tool_names
                    .iter()
                    .map(|t| ToolDefinition::simple(*t, "test tool", serde_json::json!({})))
                    .collect(),
                required: Vec::new(),
                fail: AtomicBool::new(false),
                calls: AtomicU32::new(0),
            }
        }

        fn with_required(mut self, keys: Vec<&'static str>) -> Self {
            self.required = keys;
            self
        }
    }

    #[async_trait]
    impl Skill for TestSkill {
        fn name(&self) -> &str {
            &self.name
        }
        fn tools(&self) -> Vec<ToolDefinition> {
            self.tools.clone()
        }
        fn required_config(&self) -> Vec<&'static str> {
            self.required.clone()
        }
        async fn execute(&self, tool: &str, _input: &Value) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                Err(Error::Other("boom".into()))
            } else {
                Ok(format!("{tool} ok"))
            }
        }
    }

    fn registry() -> SkillRegistry {
        registry_with(HealthConfig::default())
    }

    fn registry_with(health: HealthConfig) -> SkillRegistry {
        SkillRegistry::new(
            Arc::new(HealthTracker::new(health)),
            Arc::new(ClassifiedErrorStore::default()),
        )
    }

    #[tokio::test]
    async fn register_and_execute() {
        let reg = registry();
        reg.register(Arc::new(TestSkill::new("notes", &["notes_list"])), HashMap::new())
            .await
            .unwrap();

        let out = reg.execute_tool("notes_list", &serde_json::json!({})).await;
        assert!(!out.is_error);
        assert_eq!(out.content, "notes_list ok");
        assert_eq!(reg.owner_of("notes_list").as_deref(), Some("notes"));
    }

    #[tokio::test]
    async fn missing_required_config_rejected() {
        let reg = registry();
        let skill = TestSkill::new("email", &["email_send"]).with_required(vec!["smtp_host"]);
        let err = reg.register(Arc::new(skill), HashMap::new()).await.unwrap_err();
        assert!(err.to_string().contains("smtp_host"));
        assert!(!reg.has_tool("email_send"));
    }

    #[tokio::test]
    async fn tool_name_collision_rejected() {
        let reg = registry();
        reg.register(Arc::new(TestSkill::new("notes", &["search"])), HashMap::new())
            .await
            .unwrap();
        let err = reg
            .register(Arc::new(TestSkill::new("memory", &["search"])), HashMap::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
        // The colliding skill contributed nothing.
        assert_eq!(reg.owner_of("search").as_deref(), Some("notes"));
    }

    #[tokio::test]
    async fn unknown_tool_is_soft_error() {
        let reg = registry();
        let out = reg.execute_tool("nope", &serde_json::json!({})).await;
        assert!(out.is_error);
        assert!(out.content.contains("Unknown tool"));
    }

    #[tokio::test]
    async fn listing_filters() {
        let reg = registry();
        reg.register(Arc::new(TestSkill::new("notes", &["notes_list"])), HashMap::new())
            .await
            .unwrap();
        let mut privileged = TestSkill::new("admin", &["admin_wipe"]);
        privileged.tools[0].main_agent_only = true;
        privileged.tools[0].permission_tier = 3;
        reg.register(Arc::new(privileged), HashMap::new()).await.unwrap();

        let all = reg.list_tools(&ToolFilter::all());
        assert_eq!(all.len(), 2);

        let subagent = reg.list_tools(&ToolFilter::for_subagent(None, &[]));
        assert_eq!(subagent.len(), 1);
        assert_eq!(subagent[0].name, "notes_list");

        let scoped = reg.list_tools(&ToolFilter::for_subagent(
            Some(&["notes_list".to_string()]),
            &[],
        ));
        assert_eq!(scoped.len(), 1);

        let blocked = reg.list_tools(&ToolFilter::for_subagent(
            None,
            &["notes_list".to_string()],
        ));
        assert!(blocked.is_empty());

        let by_skill = reg.list_tools(&ToolFilter {
            allowed_skills: Some(["admin".to_string()].into()),
            ..ToolFilter::all()
        });
        assert_eq!(by_skill.len(), 1);
        assert_eq!(by_skill[0].name, "admin_wipe");
    }

    #[tokio::test]
    async fn requires_confirmation_flag() {
        let reg = registry();
        let mut skill = TestSkill::new("email", &["email_send"]);
        skill.tools[0].requires_confirmation = true;
        reg.register(Arc::new(skill), HashMap::new()).await.unwrap();
        assert!(reg.requires_confirmation("email_send"));
        assert!(!reg.requires_confirmation("missing"));
    }

    #[tokio::test]
    async fn failures_are_recorded_and_classified() {
        let reg = registry();
        let skill = Arc::new(TestSkill::new("email", &["email_send"]));
        skill.fail.store(true, Ordering::SeqCst);
        reg.register(skill, HashMap::new()).await.unwrap();

        let out = reg.execute_tool("email_send", &serde_json::json!({})).await;
        assert!(out.is_error);
        assert!(out.content.contains("email_send"));

        assert_eq!(reg.errors().len(), 1);
        let health = reg.health().get("email").unwrap();
        assert_eq!(health.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn degraded_skill_recovers_through_probe() {
        // Thresholds (3, 5) with a 100ms recovery window.
        let reg = registry_with(HealthConfig {
            degraded_threshold: 3,
            unavailable_threshold: 5,
            recovery_window_ms: 100,
        });
        let skill = Arc::new(TestSkill::new("email", &["email_send"]));
        skill.fail.store(true, Ordering::SeqCst);
        reg.register(skill.clone(), HashMap::new()).await.unwrap();

        for _ in 0..5 {
            let out = reg.execute_tool("email_send", &serde_json::json!({})).await;
            assert!(out.is_error);
        }
        assert_eq!(reg.health().status("email"), crate::health::SkillStatus::Unavailable);

        // Inside the window the skill is not even invoked.
        let calls_before = skill.calls.load(Ordering::SeqCst);
        let out = reg.execute_tool("email_send", &serde_json::json!({})).await;
        assert!(out.is_error);
        assert!(out.content.contains("temporarily unavailable"));
        assert_eq!(skill.calls.load(Ordering::SeqCst), calls_before);

        // Past the window a probe goes through and heals the skill.
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        skill.fail.store(false, Ordering::SeqCst);
        let out = reg.execute_tool("email_send", &serde_json::json!({})).await;
        assert!(!out.is_error);

        let health = reg.health().get("email").unwrap();
        assert_eq!(health.status, crate::health::SkillStatus::Healthy);
        assert_eq!(health.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_inside_one_call() {
        struct FlakyOnce {
            calls: AtomicU32,
        }

        #[async_trait]
        impl Skill for FlakyOnce {
            fn name(&self) -> &str {
                "flaky"
            }
            fn tools(&self) -> Vec<ToolDefinition> {
                vec![ToolDefinition::simple("flaky_op", "", serde_json::json!({}))]
            }
            async fn execute(&self, _tool: &str, _input: &Value) -> Result<String> {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::Other("HTTP 503 upstream".into()))
                } else {
                    Ok("ok".into())
                }
            }
        }

        let reg = registry();
        reg.register(
            Arc::new(FlakyOnce {
                calls: AtomicU32::new(0),
            }),
            HashMap::new(),
        )
        .await
        .unwrap();

        let out = reg.execute_tool("flaky_op", &serde_json::json!({})).await;
        assert!(!out.is_error, "transient error should be retried away");
        // The retry happened inside one pipeline pass: one success
        // recorded, zero failures.
        let health = reg.health().get("flaky").unwrap();
        assert_eq!(health.total_failures, 0);
        assert_eq!(health.total_successes, 1);
    }

    #[tokio::test]
    async fn user_facing_messages_by_category() {
        let msg = user_facing_failure(
            "email_send",
            ErrorCategory::Transient,
            &Error::Other("HTTP 503".into()),
        );
        assert!(msg.contains("temporarily unavailable"));

        let msg = user_facing_failure(
            "email_send",
            ErrorCategory::AuthExpired,
            &Error::Auth("expired".into()),
        );
        assert!(msg.contains("credentials"));
    }
}
