//! Directory-service binding and account identity.
//!
//! Wraps `dsconfigad`, `dscl`, `dscacheutil` and `dseditgroup`. Mutations are
//! idempotent: every operation checks current state first and reports
//! `Skipped` when there is nothing to do.
use crate::clock::Clock;
use crate::error::OffboardError;
use crate::host::Host;
use crate::report::StepResult;
use std::rc::Rc;
use std::time::Duration;

/// Wait after restarting the identity daemon before re-reading records.
pub const IDENTITY_SETTLE_DELAY: Duration = Duration::from_secs(5);

const AD_NODE_PREFIX: &str = "/Active Directory/";
const SEARCH_NODES: [&str; 2] = ["/Search", "/Search/Contacts"];

/// Attributes only mobile (network-cached) accounts carry.
const CACHED_ACCOUNT_ATTRIBUTES: &[&str] = &[
    "cached_groups",
    "cached_auth_policy",
    "CopyTimestamp",
    "AltSecurityIdentities",
    "SMBPrimaryGroupSID",
    "OriginalAuthenticationAuthority",
    "OriginalNodeName",
    "SMBSID",
    "SMBScriptPath",
    "SMBPasswordLastSet",
    "SMBGroupRID",
    "PrimaryNTDomain",
    "AppleMetaRecordName",
    "MCXSettings",
    "MCXFlags",
];

const SHADOW_HASH_TAG: &str = ";ShadowHash;";
const CACHED_USER_TAG: &str = ";LocalCachedUser;";
const KERBEROS_TAG: &str = ";Kerberosv5;";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Local,
    NetworkCached,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAccount {
    pub name: String,
    pub home_directory: Option<String>,
    pub authority_entries: Vec<String>,
}

impl LocalAccount {
    pub fn is_network_cached(&self) -> bool {
        self.account_type() == AccountType::NetworkCached
    }

    pub fn account_type(&self) -> AccountType {
        classify_authorities(&self.authority_entries)
    }
}

pub fn classify_authorities(entries: &[String]) -> AccountType {
    if entries.iter().any(|entry| entry.contains(CACHED_USER_TAG)) {
        AccountType::NetworkCached
    } else if entries.iter().any(|entry| entry.contains(SHADOW_HASH_TAG)) {
        AccountType::Local
    } else {
        AccountType::Unknown
    }
}

/// Ordered removals applied to an `AuthenticationAuthority` list.
///
/// Kerberos entries go first, then the cached-user entry; the `ShadowHash`
/// entry holding the password is never touched. Applied removals cannot be
/// rolled back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorityPatch {
    pub removals: Vec<String>,
}

impl AuthorityPatch {
    pub fn plan(user: &str, entries: &[String]) -> Result<Self, OffboardError> {
        if !entries.iter().any(|entry| entry.contains(SHADOW_HASH_TAG)) {
            return Err(OffboardError::AuthorityPatchRefused {
                user: user.to_string(),
                reason: "no ShadowHash entry; removing cached authorities would lose the password"
                    .to_string(),
            });
        }
        let mut removals: Vec<String> = entries
            .iter()
            .filter(|entry| entry.contains(KERBEROS_TAG))
            .cloned()
            .collect();
        removals.extend(
            entries
                .iter()
                .filter(|entry| entry.contains(CACHED_USER_TAG))
                .cloned(),
        );
        Ok(Self { removals })
    }

    pub fn is_empty(&self) -> bool {
        self.removals.is_empty()
    }
}

pub struct DirectoryIdentityAdapter {
    host: Rc<dyn Host>,
    clock: Rc<dyn Clock>,
    settle_delay: Duration,
}

impl DirectoryIdentityAdapter {
    pub fn new(host: Rc<dyn Host>, clock: Rc<dyn Clock>) -> Self {
        Self {
            host,
            clock,
            settle_delay: IDENTITY_SETTLE_DELAY,
        }
    }

    pub fn is_bound(&self) -> bool {
        match self.host.run("dsconfigad", &["-show"]) {
            Ok(output) => output.success() && output.stdout.contains("Active Directory Domain"),
            Err(err) => {
                tracing::warn!(error = %err, "dsconfigad -show failed; assuming unbound");
                false
            }
        }
    }

    /// Remove the directory binding and the AD search-path entries.
    ///
    /// Search-path cleanup runs even when the removal call fails.
    pub fn unbind(&self) -> Result<StepResult, OffboardError> {
        if !self.is_bound() {
            tracing::info!("not bound to a directory; nothing to unbind");
            return Ok(StepResult::skipped());
        }

        let removal = self.host.run(
            "dsconfigad",
            &["-remove", "-force", "-u", "nobody", "-p", "nobody"],
        );
        let warnings = self.reset_search_paths();

        match removal {
            Ok(output) if output.success() => {
                tracing::info!("directory binding removed");
                Ok(StepResult::success().with_warnings(warnings))
            }
            Ok(output) => Err(OffboardError::UnbindFailed(output.describe())),
            Err(err) => Err(OffboardError::UnbindFailed(format!("{err:#}"))),
        }
    }

    fn reset_search_paths(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for node in SEARCH_NODES {
            let paths = match self.host.run("dscl", &[node, "-read", "/", "CSPSearchPath"]) {
                Ok(output) if output.success() => parse_search_paths(&output.stdout),
                Ok(output) => {
                    warnings.push(format!("read {node} search path: {}", output.describe()));
                    Vec::new()
                }
                Err(err) => {
                    warnings.push(format!("read {node} search path: {err:#}"));
                    Vec::new()
                }
            };
            for path in paths.iter().filter(|path| path.starts_with(AD_NODE_PREFIX)) {
                self.best_effort(
                    &mut warnings,
                    &format!("remove {path} from {node}"),
                    &[node, "-delete", "/", "CSPSearchPath", path],
                );
            }
            self.best_effort(
                &mut warnings,
                &format!("reset {node} search policy"),
                &[
                    node,
                    "-change",
                    "/",
                    "SearchPolicy",
                    "dsAttrTypeStandard:CSPSearchPath",
                    "dsAttrTypeStandard:NSPSearchPath",
                ],
            );
        }
        for warning in &warnings {
            tracing::warn!(%warning, "search path cleanup");
        }
        warnings
    }

    fn best_effort(&self, warnings: &mut Vec<String>, label: &str, args: &[&str]) {
        match self.host.run("dscl", args) {
            Ok(output) if output.success() => {}
            Ok(output) => warnings.push(format!("{label}: {}", output.describe())),
            Err(err) => warnings.push(format!("{label}: {err:#}")),
        }
    }

    pub fn read_account(&self, user: &str) -> Result<LocalAccount, OffboardError> {
        let record = format!("/Users/{user}");
        let output = self
            .host
            .run("dscl", &[".", "-read", &record, "AuthenticationAuthority"])
            .map_err(|err| lookup_failed(user, format!("{err:#}")))?;
        if !output.success() {
            return Err(lookup_failed(user, output.describe()));
        }
        let authority_entries = parse_authority_entries(&output.stdout);

        let home_directory = match self
            .host
            .run("dscl", &[".", "-read", &record, "NFSHomeDirectory"])
        {
            Ok(output) if output.success() => parse_single_value(&output.stdout),
            _ => None,
        };

        Ok(LocalAccount {
            name: user.to_string(),
            home_directory,
            authority_entries,
        })
    }

    pub fn account_type(&self, user: &str) -> AccountType {
        match self.read_account(user) {
            Ok(account) => account.account_type(),
            Err(err) => {
                tracing::warn!(user, error = %err, "account type unknown");
                AccountType::Unknown
            }
        }
    }

    /// Turn a network-cached account into a plain local account.
    ///
    /// A failed final re-check is fatal: the account is left half converted.
    pub fn convert(&self, user: &str, make_admin: bool) -> Result<StepResult, OffboardError> {
        let account = self.read_account(user)?;
        if !account.is_network_cached() {
            tracing::info!(user, account_type = ?account.account_type(), "not network-cached; skipping");
            return Ok(StepResult::skipped());
        }

        let patch = AuthorityPatch::plan(user, &account.authority_entries)?;
        let mut warnings = self.strip_cached_attributes(user);
        let patched = self.apply_authority_patch(user, &patch, &mut warnings);
        self.reload_identity_cache(&mut warnings);

        let converted = match self.read_account(user) {
            Ok(after) => after.account_type() == AccountType::Local,
            Err(err) => {
                tracing::error!(user, error = %err, "cannot re-read account after conversion");
                false
            }
        };
        if !patched || !converted {
            tracing::error!(user, patched, converted, "account not verified local after conversion");
            return Err(OffboardError::ConversionFailed {
                user: user.to_string(),
            });
        }

        self.repair_ownership(&account, &mut warnings);
        self.add_to_group(user, "staff", &mut warnings);
        if make_admin {
            self.add_to_group(user, "admin", &mut warnings);
        }

        tracing::info!(user, warnings = warnings.len(), "account converted to local");
        Ok(StepResult::success().with_warnings(warnings))
    }

    fn strip_cached_attributes(&self, user: &str) -> Vec<String> {
        let record = format!("/Users/{user}");
        let mut warnings = Vec::new();
        for attribute in CACHED_ACCOUNT_ATTRIBUTES {
            match self.host.run("dscl", &[".", "-delete", &record, attribute]) {
                Ok(output) if output.success() => {}
                Ok(output) => {
                    tracing::warn!(user, attribute, detail = %output.describe(), "attribute removal failed");
                    warnings.push(format!("remove {attribute}: {}", output.describe()));
                }
                Err(err) => {
                    tracing::warn!(user, attribute, error = %err, "attribute removal failed");
                    warnings.push(format!("remove {attribute}: {err:#}"));
                }
            }
        }
        warnings
    }

    /// Returns false when a removal failed and the rest were not attempted.
    fn apply_authority_patch(
        &self,
        user: &str,
        patch: &AuthorityPatch,
        warnings: &mut Vec<String>,
    ) -> bool {
        if patch.is_empty() {
            return true;
        }
        let record = format!("/Users/{user}");
        tracing::warn!(
            user,
            removals = patch.removals.len(),
            "editing AuthenticationAuthority; applied removals cannot be rolled back"
        );
        for (applied, entry) in patch.removals.iter().enumerate() {
            let result = self
                .host
                .run("dscl", &[".", "-delete", &record, "AuthenticationAuthority", entry]);
            let failure = match result {
                Ok(output) if output.success() => continue,
                Ok(output) => output.describe(),
                Err(err) => format!("{err:#}"),
            };
            tracing::error!(user, applied, %failure, "authority patch stopped part way");
            warnings.push(format!(
                "authority patch stopped after {applied} of {} removals: {failure}",
                patch.removals.len()
            ));
            return false;
        }
        true
    }

    fn reload_identity_cache(&self, warnings: &mut Vec<String>) {
        for (program, args) in [
            ("dscacheutil", &["-flushcache"][..]),
            ("killall", &["opendirectoryd"][..]),
        ] {
            match self.host.run(program, args) {
                Ok(output) if output.success() => {}
                Ok(output) => warnings.push(format!("{program}: {}", output.describe())),
                Err(err) => warnings.push(format!("{program}: {err:#}")),
            }
        }
        self.clock.sleep(self.settle_delay);
    }

    fn repair_ownership(&self, account: &LocalAccount, warnings: &mut Vec<String>) {
        let Some(home) = account.home_directory.as_deref() else {
            warnings.push(format!("no home directory recorded for {}", account.name));
            return;
        };
        let owner = format!("{}:staff", account.name);
        match self.host.run("chown", &["-R", &owner, home]) {
            Ok(output) if output.success() => {}
            Ok(output) => warnings.push(format!("chown {home}: {}", output.describe())),
            Err(err) => warnings.push(format!("chown {home}: {err:#}")),
        }
    }

    fn add_to_group(&self, user: &str, group: &str, warnings: &mut Vec<String>) {
        let args = ["-o", "edit", "-a", user, "-t", "user", group];
        match self.host.run("dseditgroup", &args) {
            Ok(output) if output.success() => {}
            Ok(output) => warnings.push(format!("add {user} to {group}: {}", output.describe())),
            Err(err) => warnings.push(format!("add {user} to {group}: {err:#}")),
        }
    }
}

fn lookup_failed(user: &str, detail: String) -> OffboardError {
    OffboardError::AccountLookupFailed {
        user: user.to_string(),
        detail,
    }
}

/// Values of a `dscl -read` attribute, in either the inline or the
/// one-value-per-line layout.
fn attribute_values(text: &str) -> Vec<String> {
    let mut lines = text.lines();
    let Some(first) = lines.next() else {
        return Vec::new();
    };
    let inline = first
        .split_once(':')
        .map(|(_, rest)| rest.trim())
        .unwrap_or_default();
    let mut values = Vec::new();
    if !inline.is_empty() {
        values.push(inline.to_string());
    }
    values.extend(
        lines
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string),
    );
    values
}

fn parse_single_value(text: &str) -> Option<String> {
    attribute_values(text).into_iter().next()
}

/// Split authority values into entries; every entry starts with `;`.
pub fn parse_authority_entries(text: &str) -> Vec<String> {
    let mut entries: Vec<String> = Vec::new();
    for value in attribute_values(text) {
        for token in value.split_whitespace() {
            match entries.last_mut() {
                Some(last) if !token.starts_with(';') => {
                    last.push(' ');
                    last.push_str(token);
                }
                _ => entries.push(token.to_string()),
            }
        }
    }
    entries
}

/// Search-path nodes; node names may contain spaces but always start with `/`.
fn parse_search_paths(text: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for value in attribute_values(text) {
        let mut current = String::new();
        for token in value.split(' ') {
            if token.starts_with('/') && !current.is_empty() {
                paths.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(token);
        }
        if !current.is_empty() {
            paths.push(current);
        }
    }
    paths
}

#[cfg(test)]
#[path = "directory_tests.rs"]
mod tests;
