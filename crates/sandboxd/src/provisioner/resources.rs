//! CPU/memory quantities and the override precedence chain.

use anyhow::{Result, bail};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cluster::ResourceRequirements;

pub const DEFAULT_CPU_REQUEST: &str = "2";
pub const DEFAULT_CPU_LIMIT: &str = "2";
pub const DEFAULT_MEMORY_REQUEST: &str = "4Gi";
pub const DEFAULT_MEMORY_LIMIT: &str = "4Gi";

static QUANTITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9]+(?:\.[0-9]+)?)(m|k|M|G|T|P|E|Ki|Mi|Gi|Ti|Pi|Ei)?$")
        .expect("quantity pattern is valid")
});

/// Parse a cluster quantity string into its base-unit value.
pub fn parse_quantity(raw: &str) -> Option<f64> {
    let caps = QUANTITY.captures(raw.trim())?;
    let number: f64 = caps.get(1)?.as_str().parse().ok()?;
    if caps.get(2).map(|m| m.as_str()) == Some("m") {
        return Some(number / 1000.0);
    }
    let scale = match caps.get(2).map(|m| m.as_str()) {
        None => 1.0,
        Some("k") => 1e3,
        Some("M") => 1e6,
        Some("G") => 1e9,
        Some("T") => 1e12,
        Some("P") => 1e15,
        Some("E") => 1e18,
        Some("Ki") => 1024.0,
        Some("Mi") => 1024f64.powi(2),
        Some("Gi") => 1024f64.powi(3),
        Some("Ti") => 1024f64.powi(4),
        Some("Pi") => 1024f64.powi(5),
        Some("Ei") => 1024f64.powi(6),
        Some(_) => return None,
    };
    Some(number * scale)
}

fn check_pair(
    request_field: &str,
    request: Option<&str>,
    limit_field: &str,
    limit: Option<&str>,
) -> Result<()> {
    let parse = |field: &str, raw: Option<&str>| -> Result<Option<f64>> {
        match raw.map(str::trim).filter(|v| !v.is_empty()) {
            None => Ok(None),
            Some(v) => match parse_quantity(v) {
                Some(q) => Ok(Some(q)),
                None => bail!("invalid {field} '{v}'"),
            },
        }
    };
    let req = parse(request_field, request)?;
    let lim = parse(limit_field, limit)?;
    if let (Some(r), Some(l)) = (req, lim)
        && r > l
    {
        bail!("{request_field} must be less than or equal to {limit_field}");
    }
    Ok(())
}

/// Partial CPU/memory settings at one precedence level (agent, user or system).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_request: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_request: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
}

impl ResourceOverrides {
    /// Blank strings count as unset.
    pub fn normalized(self) -> Self {
        let clean = |v: Option<String>| {
            v.map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        Self {
            cpu_request: clean(self.cpu_request),
            cpu_limit: clean(self.cpu_limit),
            memory_request: clean(self.memory_request),
            memory_limit: clean(self.memory_limit),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cpu_request.is_none()
            && self.cpu_limit.is_none()
            && self.memory_request.is_none()
            && self.memory_limit.is_none()
    }

    /// Quantity syntax, and request <= limit where both are set.
    pub fn validate(&self) -> Result<()> {
        check_pair(
            "cpu_request",
            self.cpu_request.as_deref(),
            "cpu_limit",
            self.cpu_limit.as_deref(),
        )?;
        check_pair(
            "memory_request",
            self.memory_request.as_deref(),
            "memory_limit",
            self.memory_limit.as_deref(),
        )
    }

    /// Fill unset fields from a lower-precedence level.
    pub fn or(self, lower: &ResourceOverrides) -> Self {
        Self {
            cpu_request: self.cpu_request.or_else(|| lower.cpu_request.clone()),
            cpu_limit: self.cpu_limit.or_else(|| lower.cpu_limit.clone()),
            memory_request: self.memory_request.or_else(|| lower.memory_request.clone()),
            memory_limit: self.memory_limit.or_else(|| lower.memory_limit.clone()),
        }
    }

    /// Resolve against the built-in defaults.
    pub fn resolve(self) -> ResourceRequirements {
        ResourceRequirements {
            cpu_request: self
                .cpu_request
                .unwrap_or_else(|| DEFAULT_CPU_REQUEST.to_string()),
            cpu_limit: self
                .cpu_limit
                .unwrap_or_else(|| DEFAULT_CPU_LIMIT.to_string()),
            memory_request: self
                .memory_request
                .unwrap_or_else(|| DEFAULT_MEMORY_REQUEST.to_string()),
            memory_limit: self
                .memory_limit
                .unwrap_or_else(|| DEFAULT_MEMORY_LIMIT.to_string()),
        }
    }
}

/// Effective resources: agent > user > system > built-in default.
pub fn effective_resources(
    agent: &ResourceOverrides,
    user: &ResourceOverrides,
    system: &ResourceOverrides,
) -> ResourceRequirements {
    agent
        .clone()
        .normalized()
        .or(&user.clone().normalized())
        .or(&system.clone().normalized())
        .resolve()
}

/// Validate fully resolved requirements before they reach the cluster.
pub fn validate_requirements(res: &ResourceRequirements) -> Result<()> {
    check_pair(
        "cpu_request",
        Some(&res.cpu_request),
        "cpu_limit",
        Some(&res.cpu_limit),
    )?;
    check_pair(
        "memory_request",
        Some(&res.memory_request),
        "memory_limit",
        Some(&res.memory_limit),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overrides(cpu_req: Option<&str>, mem_lim: Option<&str>) -> ResourceOverrides {
        ResourceOverrides {
            cpu_request: cpu_req.map(str::to_string),
            memory_limit: mem_lim.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn parses_quantities() {
        assert_eq!(parse_quantity("500m"), Some(0.5));
        assert_eq!(parse_quantity("2"), Some(2.0));
        assert_eq!(parse_quantity("4Gi"), Some(4.0 * 1024.0 * 1024.0 * 1024.0));
        assert_eq!(parse_quantity("1.5"), Some(1.5));
        assert_eq!(parse_quantity("2x"), None);
        assert_eq!(parse_quantity(""), None);
    }

    #[test]
    fn validation_rejects_bad_syntax_and_inverted_pairs() {
        let bad = overrides(Some("two"), None);
        assert!(bad.validate().unwrap_err().to_string().contains("invalid cpu_request"));

        let inverted = ResourceOverrides {
            memory_request: Some("8Gi".to_string()),
            memory_limit: Some("4Gi".to_string()),
            ..Default::default()
        };
        assert!(inverted.validate().is_err());

        let ok = ResourceOverrides {
            cpu_request: Some("500m".to_string()),
            cpu_limit: Some("1".to_string()),
            ..Default::default()
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn precedence_is_agent_user_system_default() {
        let agent = overrides(Some("1"), None);
        let user = overrides(Some("3"), Some("8Gi"));
        let system = ResourceOverrides {
            cpu_limit: Some("4".to_string()),
            memory_limit: Some("16Gi".to_string()),
            ..Default::default()
        };

        let res = effective_resources(&agent, &user, &system);
        assert_eq!(res.cpu_request, "1");
        assert_eq!(res.memory_limit, "8Gi");
        assert_eq!(res.cpu_limit, "4");
        assert_eq!(res.memory_request, DEFAULT_MEMORY_REQUEST);
    }

    #[test]
    fn blank_overrides_fall_through() {
        let agent = overrides(Some("  "), None);
        let res = effective_resources(&agent, &Default::default(), &Default::default());
        assert_eq!(res.cpu_request, DEFAULT_CPU_REQUEST);
    }
}
