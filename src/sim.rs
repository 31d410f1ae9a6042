//! Test doubles: a fake clock, a scripted host, a simulated Mac and a fake
//! management backend.
use crate::clock::Clock;
use crate::host::{CommandOutput, Host};
use crate::mdm::http::{ApiRequest, ApiResponse, Auth, HttpTransport, Method};
use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

pub struct FakeClock {
    now: Cell<i64>,
    slept: Cell<Duration>,
    sleeps: Cell<u32>,
}

impl FakeClock {
    pub fn new(now: i64) -> Self {
        Self {
            now: Cell::new(now),
            slept: Cell::new(Duration::ZERO),
            sleeps: Cell::new(0),
        }
    }

    pub fn advance(&self, seconds: i64) {
        self.now.set(self.now.get() + seconds);
    }

    pub fn slept(&self) -> Duration {
        self.slept.get()
    }

    pub fn sleeps(&self) -> u32 {
        self.sleeps.get()
    }
}

impl Clock for FakeClock {
    fn now_epoch_seconds(&self) -> i64 {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.slept.set(self.slept.get() + duration);
        self.sleeps.set(self.sleeps.get() + 1);
        self.advance(duration.as_secs() as i64);
    }
}

/// Host that replays queued outputs per program and records every call.
#[derive(Default)]
pub struct ScriptedHost {
    queued: RefCell<HashMap<String, VecDeque<CommandOutput>>>,
    calls: RefCell<Vec<String>>,
}

impl ScriptedHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, program: &str, output: CommandOutput) {
        self.queued
            .borrow_mut()
            .entry(program.to_string())
            .or_default()
            .push_back(output);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

impl Host for ScriptedHost {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.calls
            .borrow_mut()
            .push(format!("{program} {}", args.join(" ")));
        let next = self
            .queued
            .borrow_mut()
            .get_mut(program)
            .and_then(VecDeque::pop_front);
        Ok(next.unwrap_or_else(|| CommandOutput::failed(127, format!("{program}: unscripted"))))
    }

    fn run_with_input(&self, program: &str, args: &[&str], _input: &str) -> Result<CommandOutput> {
        self.run(program, args)
    }

    fn path_exists(&self, _path: &Path) -> bool {
        false
    }

    fn effective_uid(&self) -> u32 {
        0
    }

    fn locate(&self, _program: &str) -> Option<PathBuf> {
        None
    }
}

pub const AGENT_BINARY: &str = "/usr/local/bin/jamf";
pub const ENROLLMENT_APP: &str = "/Applications/Company Portal.app";
pub const AD_SEARCH_NODE: &str = "/Active Directory/ACME/All Domains";
const SHADOW_HASH: &str = ";ShadowHash;HASHLIST:<SALTED-SHA512-PBKDF2,SRP-RFC5054-4096-SHA512-PBKDF2>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskState {
    On,
    Off,
    Encrypting,
    Decrypting,
}

#[derive(Debug, Clone)]
pub struct SimUser {
    pub uid: u32,
    pub authority: Vec<String>,
    pub attributes: BTreeSet<String>,
    pub home: String,
    pub groups: BTreeSet<String>,
}

impl SimUser {
    pub fn local(name: &str, uid: u32) -> Self {
        Self {
            uid,
            authority: vec![SHADOW_HASH.to_string()],
            attributes: BTreeSet::new(),
            home: format!("/Users/{name}"),
            groups: BTreeSet::from(["staff".to_string()]),
        }
    }

    pub fn network_cached(name: &str, uid: u32) -> Self {
        let attributes = [
            "cached_groups",
            "cached_auth_policy",
            "CopyTimestamp",
            "OriginalAuthenticationAuthority",
            "OriginalNodeName",
            "SMBSID",
            "PrimaryNTDomain",
        ];
        Self {
            uid,
            authority: vec![
                format!(";LocalCachedUser;/Active Directory/ACME/acme.com:{name}:9F1B3C2A"),
                format!(";Kerberosv5;;{name}@ACME.COM;ACME.COM;"),
                SHADOW_HASH.to_string(),
            ],
            attributes: attributes.iter().map(|a| a.to_string()).collect(),
            home: format!("/Users/{name}"),
            groups: BTreeSet::new(),
        }
    }
}

/// Mutable state of the simulated machine. Tests tweak it directly.
#[derive(Debug, Clone)]
pub struct MacState {
    pub euid: u32,
    pub os_version: String,
    pub serial: String,
    pub console_user: Option<String>,
    pub paths: BTreeSet<String>,

    pub bound: bool,
    pub unbind_fails: bool,
    pub search_paths: BTreeMap<String, Vec<String>>,
    pub search_policy: BTreeMap<String, String>,

    pub users: BTreeMap<String, SimUser>,
    /// When false, authority edits are accepted but do not take effect.
    pub authority_edits_stick: bool,
    pub chowned: Vec<String>,

    pub disk: DiskState,
    pub filevault_users: Vec<String>,
    pub password: String,
    pub fdesetup_always_errors: bool,
    pub fdesetup_attempts: u32,

    pub enrolled: bool,
    pub mdm_removal_works: bool,
    pub agent_installed: bool,
    pub profiles: Vec<String>,
    pub remove_mdm_calls: u32,

    pub prompt_replies: VecDeque<Option<String>>,
    pub prompts: Vec<String>,
    pub opened: Vec<String>,
}

impl Default for MacState {
    fn default() -> Self {
        Self {
            euid: 0,
            os_version: "14.4.1".to_string(),
            serial: "c02xk1abjg5h".to_string(),
            console_user: Some("jdoe".to_string()),
            paths: BTreeSet::from([ENROLLMENT_APP.to_string()]),
            bound: false,
            unbind_fails: false,
            search_paths: BTreeMap::from([
                ("/Search".to_string(), vec!["/Local/Default".to_string()]),
                ("/Search/Contacts".to_string(), vec!["/Local/Default".to_string()]),
            ]),
            search_policy: BTreeMap::from([
                ("/Search".to_string(), "dsAttrTypeStandard:NSPSearchPath".to_string()),
                (
                    "/Search/Contacts".to_string(),
                    "dsAttrTypeStandard:NSPSearchPath".to_string(),
                ),
            ]),
            users: BTreeMap::from([("jdoe".to_string(), SimUser::local("jdoe", 501))]),
            authority_edits_stick: true,
            chowned: Vec::new(),
            disk: DiskState::Off,
            filevault_users: vec!["jdoe".to_string()],
            password: "correct horse".to_string(),
            fdesetup_always_errors: false,
            fdesetup_attempts: 0,
            enrolled: false,
            mdm_removal_works: true,
            agent_installed: false,
            profiles: Vec::new(),
            remove_mdm_calls: 0,
            prompt_replies: VecDeque::new(),
            prompts: Vec::new(),
            opened: Vec::new(),
        }
    }
}

impl MacState {
    /// Bind to the ACME domain with a custom search policy.
    pub fn bind(&mut self) {
        self.bound = true;
        for node in ["/Search", "/Search/Contacts"] {
            self.search_paths.insert(
                node.to_string(),
                vec!["/Local/Default".to_string(), AD_SEARCH_NODE.to_string()],
            );
            self.search_policy
                .insert(node.to_string(), "dsAttrTypeStandard:CSPSearchPath".to_string());
        }
    }

    pub fn enroll(&mut self) {
        self.enrolled = true;
        self.agent_installed = true;
        self.profiles = vec!["com.acme.mdm".to_string(), "com.acme.wifi".to_string()];
    }

    pub fn queue_password(&mut self, password: &str) {
        self.prompt_replies.push_back(Some(password.to_string()));
    }

    pub fn queue_cancel(&mut self) {
        self.prompt_replies.push_back(None);
    }
}

/// Host that behaves like a small macOS machine for the commands the
/// workflow issues.
#[derive(Default)]
pub struct SimulatedMac {
    state: RefCell<MacState>,
    calls: RefCell<Vec<String>>,
}

impl SimulatedMac {
    pub fn new(state: MacState) -> Rc<Self> {
        Rc::new(Self {
            state: RefCell::new(state),
            calls: RefCell::new(Vec::new()),
        })
    }

    pub fn state(&self) -> std::cell::Ref<'_, MacState> {
        self.state.borrow()
    }

    pub fn state_mut(&self) -> std::cell::RefMut<'_, MacState> {
        self.state.borrow_mut()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    fn dispatch(&self, program: &str, args: &[&str], input: Option<&str>) -> CommandOutput {
        let mut state = self.state.borrow_mut();
        match (program, args) {
            ("sw_vers", ["-productVersion"]) => CommandOutput::ok(format!("{}\n", state.os_version)),
            ("ioreg", _) => CommandOutput::ok(format!(
                "+-o Root  <class IORegistryEntry>\n  \"IOPlatformSerialNumber\" = \"{}\"\n",
                state.serial
            )),
            ("stat", ["-f", "%Su", "/dev/console"]) => {
                CommandOutput::ok(format!("{}\n", state.console_user.as_deref().unwrap_or("root")))
            }
            ("dsconfigad", ["-show"]) => {
                if state.bound {
                    CommandOutput::ok(
                        "Active Directory Forest          = acme.com\nActive Directory Domain          = acme.com\n",
                    )
                } else {
                    CommandOutput::ok("")
                }
            }
            ("dsconfigad", ["-remove", ..]) => {
                if state.unbind_fails {
                    CommandOutput::failed(70, "Error: The daemon encountered an error")
                } else {
                    state.bound = false;
                    CommandOutput::ok("")
                }
            }
            ("dscl", [node, "-read", "/", "CSPSearchPath"]) => {
                let paths = state.search_paths.get(*node).cloned().unwrap_or_default();
                let mut text = "CSPSearchPath:\n".to_string();
                for path in paths {
                    text.push_str(&format!(" {path}\n"));
                }
                CommandOutput::ok(text)
            }
            ("dscl", [node, "-delete", "/", "CSPSearchPath", path]) => {
                if let Some(paths) = state.search_paths.get_mut(*node) {
                    paths.retain(|existing| existing != path);
                }
                CommandOutput::ok("")
            }
            ("dscl", [node, "-change", "/", "SearchPolicy", _old, new]) => {
                state.search_policy.insert(node.to_string(), new.to_string());
                CommandOutput::ok("")
            }
            ("dscl", [".", "-list", "/Users", "UniqueID"]) => {
                let mut text = "_mbsetupuser             248\nroot                     0\n".to_string();
                for (name, user) in &state.users {
                    text.push_str(&format!("{name:<24} {}\n", user.uid));
                }
                CommandOutput::ok(text)
            }
            ("dscl", [".", "-read", record, attribute]) => {
                let Some(user) = user_for(&state, record) else {
                    return CommandOutput::failed(56, "<dscl_cmd> DS Error: -14136 (eDSRecordNotFound)");
                };
                match *attribute {
                    "AuthenticationAuthority" => CommandOutput::ok(format!(
                        "AuthenticationAuthority: {}\n",
                        user.authority.join(" ")
                    )),
                    "NFSHomeDirectory" => {
                        CommandOutput::ok(format!("NFSHomeDirectory: {}\n", user.home))
                    }
                    _ => CommandOutput::failed(181, "No such key"),
                }
            }
            ("dscl", [".", "-delete", record, "AuthenticationAuthority", entry]) => {
                let sticks = state.authority_edits_stick;
                let Some(user) = user_for_mut(&mut state, record) else {
                    return CommandOutput::failed(56, "eDSRecordNotFound");
                };
                if !sticks {
                    return CommandOutput::ok("");
                }
                let kerberos_left = user
                    .authority
                    .iter()
                    .any(|existing| existing.contains(";Kerberosv5;"));
                user.authority.retain(|existing| existing != entry);
                if entry.contains(";LocalCachedUser;") && kerberos_left {
                    // Dropping the cached-user entry ahead of Kerberos loses the hash.
                    user.authority.retain(|existing| !existing.contains(";ShadowHash;"));
                }
                CommandOutput::ok("")
            }
            ("dscl", [".", "-delete", record, attribute]) => {
                let Some(user) = user_for_mut(&mut state, record) else {
                    return CommandOutput::failed(56, "eDSRecordNotFound");
                };
                if user.attributes.remove(*attribute) {
                    CommandOutput::ok("")
                } else {
                    CommandOutput::failed(181, format!("delete {attribute}: eDSAttributeNotFound"))
                }
            }
            ("dscacheutil", ["-flushcache"]) | ("killall", ["opendirectoryd"]) => CommandOutput::ok(""),
            ("chown", ["-R", owner, home]) => {
                state.chowned.push(format!("{owner} {home}"));
                CommandOutput::ok("")
            }
            ("dseditgroup", ["-o", "edit", "-a", user, "-t", "user", group]) => {
                match state.users.get_mut(*user) {
                    Some(sim) => {
                        sim.groups.insert(group.to_string());
                        CommandOutput::ok("")
                    }
                    None => CommandOutput::failed(64, "Record was not found."),
                }
            }
            ("fdesetup", ["status"]) => CommandOutput::ok(match state.disk {
                DiskState::On => "FileVault is On.\n",
                DiskState::Off => "FileVault is Off.\n",
                DiskState::Encrypting => {
                    "FileVault is On.\nEncryption in progress: Percent completed = 12.5\n"
                }
                DiskState::Decrypting => {
                    "FileVault is On.\nDecryption in progress: Percent completed = 40.0\n"
                }
            }),
            ("fdesetup", ["list"]) => CommandOutput::ok(
                state
                    .filevault_users
                    .iter()
                    .map(|user| format!("{user},6E6E1F0A-8C2B-4B5C-9B3D-1F2E3D4C5B6A\n"))
                    .collect::<String>(),
            ),
            ("fdesetup", [verb, .., "-inputplist"]) => {
                state.fdesetup_attempts += 1;
                let input = input.unwrap_or_default();
                let expected = format!("<string>{}</string>", state.password);
                if state.fdesetup_always_errors || !input.contains(&expected) {
                    return CommandOutput::ok("Error: User could not be authenticated.\n");
                }
                match *verb {
                    "enable" => state.disk = DiskState::Encrypting,
                    "disable" => state.disk = DiskState::Decrypting,
                    _ => {}
                }
                CommandOutput::ok("")
            }
            ("osascript", ["-e", script]) => {
                if script.starts_with("display dialog") {
                    return CommandOutput::ok("button returned:OK\n");
                }
                state.prompts.push(script.to_string());
                match state.prompt_replies.pop_front() {
                    Some(Some(reply)) => CommandOutput::ok(format!("{reply}\n")),
                    Some(None) => CommandOutput::failed(1, "execution error: User canceled. (-128)"),
                    None if script.contains("hidden answer") => {
                        CommandOutput::failed(1, "execution error: User canceled. (-128)")
                    }
                    None => CommandOutput::ok("Continue\n"),
                }
            }
            ("profiles", ["status", "-type", "enrollment"]) => CommandOutput::ok(format!(
                "Enrolled via DEP: No\nMDM enrollment: {}\n",
                if state.enrolled { "Yes (User Approved)" } else { "No" }
            )),
            ("profiles", ["list"]) => {
                if state.profiles.is_empty() {
                    return CommandOutput::ok("There are no configuration profiles installed\n");
                }
                let text = state
                    .profiles
                    .iter()
                    .enumerate()
                    .map(|(idx, id)| {
                        format!("_computerlevel[{}] attribute: profileIdentifier: {id}\n", idx + 1)
                    })
                    .collect::<String>();
                CommandOutput::ok(text)
            }
            ("profiles", ["remove", "-identifier", identifier]) => {
                let before = state.profiles.len();
                state.profiles.retain(|id| id != identifier);
                if state.profiles.len() < before {
                    CommandOutput::ok("")
                } else {
                    CommandOutput::failed(1, "profile not found")
                }
            }
            (AGENT_BINARY, ["removeMDMProfile"]) => {
                state.remove_mdm_calls += 1;
                if state.mdm_removal_works {
                    state.enrolled = false;
                    state.profiles.retain(|id| id != "com.acme.mdm");
                }
                CommandOutput::ok("Removing MDM Profile...\n")
            }
            (AGENT_BINARY, ["removeFramework"]) => {
                state.agent_installed = false;
                CommandOutput::ok("Removing framework...\n")
            }
            ("pkill", ["-x", _]) => CommandOutput::failed(1, ""),
            ("open", rest) => {
                state.opened.push(rest.join(" "));
                CommandOutput::ok("")
            }
            _ => CommandOutput::failed(127, format!("{program}: not simulated")),
        }
    }
}

fn user_name(record: &str) -> &str {
    record.strip_prefix("/Users/").unwrap_or(record)
}

fn user_for<'a>(state: &'a MacState, record: &str) -> Option<&'a SimUser> {
    state.users.get(user_name(record))
}

fn user_for_mut<'a>(state: &'a mut MacState, record: &str) -> Option<&'a mut SimUser> {
    state.users.get_mut(user_name(record))
}

impl Host for SimulatedMac {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.calls
            .borrow_mut()
            .push(format!("{program} {}", args.join(" ")));
        Ok(self.dispatch(program, args, None))
    }

    fn run_with_input(&self, program: &str, args: &[&str], input: &str) -> Result<CommandOutput> {
        self.calls
            .borrow_mut()
            .push(format!("{program} {}", args.join(" ")));
        Ok(self.dispatch(program, args, Some(input)))
    }

    fn path_exists(&self, path: &Path) -> bool {
        let state = self.state.borrow();
        let path = path.to_string_lossy();
        if path == AGENT_BINARY {
            return state.agent_installed;
        }
        state.paths.contains(path.as_ref())
    }

    fn effective_uid(&self) -> u32 {
        self.state.borrow().euid
    }

    fn locate(&self, _program: &str) -> Option<PathBuf> {
        None
    }
}

/// Backend behaviour knobs plus a request log.
#[derive(Debug, Clone)]
pub struct BackendState {
    pub token_lifetime_seconds: i64,
    /// Responses served instead of minting tokens, in order.
    pub token_overrides: VecDeque<ApiResponse>,
    pub issued: u32,
    pub valid_token: Option<(String, i64)>,
    pub devices: BTreeMap<String, i64>,
    pub dispatch_status: u16,
    pub invalidate_status: u16,
    pub requests: Vec<(Method, String)>,
    /// Bearer calls made with a token the backend considered expired.
    pub expired_token_uses: u32,
    /// Fail every request at the transport level.
    pub offline: bool,
}

impl Default for BackendState {
    fn default() -> Self {
        Self {
            token_lifetime_seconds: 1200,
            token_overrides: VecDeque::new(),
            issued: 0,
            valid_token: None,
            devices: BTreeMap::from([("C02XK1ABJG5H".to_string(), 42)]),
            dispatch_status: 201,
            invalidate_status: 204,
            requests: Vec::new(),
            expired_token_uses: 0,
            offline: false,
        }
    }
}

pub struct FakeBackend {
    clock: Rc<FakeClock>,
    state: RefCell<BackendState>,
    on_dispatch: RefCell<Option<Box<dyn Fn()>>>,
}

impl FakeBackend {
    pub const BASE_URL: &'static str = "https://acme.example.com";

    pub fn new(clock: Rc<FakeClock>) -> Rc<Self> {
        Rc::new(Self {
            clock,
            state: RefCell::new(BackendState::default()),
            on_dispatch: RefCell::new(None),
        })
    }

    /// Run `hook` whenever a command is accepted, e.g. to unenroll a
    /// simulated Mac.
    pub fn on_dispatch(&self, hook: impl Fn() + 'static) {
        *self.on_dispatch.borrow_mut() = Some(Box::new(hook));
    }

    pub fn state(&self) -> std::cell::Ref<'_, BackendState> {
        self.state.borrow()
    }

    pub fn state_mut(&self) -> std::cell::RefMut<'_, BackendState> {
        self.state.borrow_mut()
    }

    pub fn count(&self, path_fragment: &str) -> usize {
        self.state
            .borrow()
            .requests
            .iter()
            .filter(|(_, url)| url.contains(path_fragment))
            .count()
    }
}

pub fn iso8601(epoch_seconds: i64) -> String {
    DateTime::from_timestamp(epoch_seconds, 0)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

impl HttpTransport for FakeBackend {
    fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let now = self.clock.now_epoch_seconds();
        let mut state = self.state.borrow_mut();
        state.requests.push((request.method, request.url.clone()));
        if state.offline {
            return Err(anyhow!("connection refused: {}", request.url));
        }
        let path = request
            .url
            .strip_prefix(Self::BASE_URL)
            .unwrap_or(&request.url)
            .to_string();

        if path == "/api/v1/auth/token" {
            if let Some(response) = state.token_overrides.pop_front() {
                return Ok(response);
            }
            state.issued += 1;
            let token = format!("token-{}", state.issued);
            let expires = now + state.token_lifetime_seconds;
            state.valid_token = Some((token.clone(), expires));
            return Ok(ApiResponse {
                status: 200,
                body: format!(r#"{{"token":"{token}","expires":"{}"}}"#, iso8601(expires)),
            });
        }

        let Auth::Bearer(presented) = &request.auth else {
            return Ok(ApiResponse {
                status: 401,
                body: String::new(),
            });
        };
        let authorized = matches!(
            &state.valid_token,
            Some((token, expires)) if token == presented && *expires > now
        );
        if !authorized {
            state.expired_token_uses += 1;
            return Ok(ApiResponse {
                status: 401,
                body: String::new(),
            });
        }

        if path == "/api/v1/auth/invalidate-token" {
            let status = state.invalidate_status;
            state.valid_token = None;
            return Ok(ApiResponse {
                status,
                body: String::new(),
            });
        }
        if let Some(rest) = path.strip_prefix("/JSSResource/computers/serialnumber/") {
            let serial = rest.split('/').next().unwrap_or_default();
            return Ok(match state.devices.get(serial) {
                Some(id) => ApiResponse {
                    status: 200,
                    body: format!(
                        "<computer><general><id>{id}</id><name>MBP-{serial}</name></general></computer>"
                    ),
                },
                None => ApiResponse {
                    status: 404,
                    body: "<html>Not Found</html>".to_string(),
                },
            });
        }
        if path.starts_with("/JSSResource/computercommands/command/") {
            let status = state.dispatch_status;
            drop(state);
            if status == 201 {
                if let Some(hook) = self.on_dispatch.borrow().as_ref() {
                    hook();
                }
            }
            return Ok(ApiResponse {
                status,
                body: String::new(),
            });
        }
        Ok(ApiResponse {
            status: 404,
            body: String::new(),
        })
    }
}
