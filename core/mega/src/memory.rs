//! In-memory MEGA server for tests.
//!
//! Implements [`ApiTransport`] with the command subset the client uses and
//! stores ciphertext exactly as uploaded, so client-side encryption, MAC
//! verification and key handling run unchanged against it.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use stowage_common::{ByteStream, Error, Result};
use stowage_crypto::kdf::{prepare_key_v1, user_hash_v1};
use stowage_crypto::{
    base64url_encode, create_temporary_session, derive_v2, wrap_master_key, MasterKey,
};

use crate::error::{EAGAIN, EARGS, EEXPIRED, ENOENT, ESID};
use crate::transport::ApiTransport;

const UPLOAD_PREFIX: &str = "mem://upload/";
const DOWNLOAD_PREFIX: &str = "mem://dl/";
const FRAME_SIZE: usize = 1000;

struct Account {
    version: u8,
    salt: Vec<u8>,
    user_hash: String,
    wrapped_master: Vec<u8>,
    master: MasterKey,
    user_handle: String,
}

#[derive(Clone)]
struct StoredNode {
    handle: String,
    parent: Option<String>,
    kind: i64,
    attrs: String,
    key: String,
    content: Option<Bytes>,
    ts: i64,
}

impl StoredNode {
    fn to_json(&self) -> Value {
        let mut node = json!({
            "h": self.handle,
            "p": self.parent.clone().unwrap_or_default(),
            "t": self.kind,
            "a": self.attrs,
            "k": self.key,
            "ts": self.ts,
        });
        if let Some(content) = &self.content {
            node["s"] = json!(content.len());
        }
        node
    }
}

struct PendingUpload {
    size: u64,
    data: Vec<u8>,
}

#[derive(Default)]
struct ServerState {
    accounts: HashMap<String, Account>,
    sessions: HashMap<String, String>,
    nodes: Vec<StoredNode>,
    uploads: HashMap<String, PendingUpload>,
    completed: HashMap<String, Bytes>,
    links: HashMap<String, String>,
    revoked: HashMap<String, (u32, String)>,
    revocation_lag: u32,
    fail_next: u32,
    commands: Vec<String>,
    next_id: u64,
}

impl ServerState {
    fn new_handle(&mut self) -> String {
        self.next_id += 1;
        base64url_encode(&self.next_id.to_be_bytes()[2..])
    }

    fn node(&self, handle: &str) -> Option<&StoredNode> {
        self.nodes.iter().find(|n| n.handle == handle)
    }

    fn ensure_roots(&mut self) {
        if !self.nodes.is_empty() {
            return;
        }
        for kind in [2, 3, 4] {
            let handle = self.new_handle();
            self.nodes.push(StoredNode {
                handle,
                parent: None,
                kind,
                attrs: String::new(),
                key: String::new(),
                content: None,
                ts: 0,
            });
        }
    }

    fn descendants(&self, root: &str) -> HashSet<String> {
        let mut found = HashSet::from([root.to_string()]);
        loop {
            let before = found.len();
            for node in &self.nodes {
                if let Some(parent) = &node.parent {
                    if found.contains(parent) {
                        found.insert(node.handle.clone());
                    }
                }
            }
            if found.len() == before {
                return found;
            }
        }
    }
}

/// In-memory stand-in for the MEGA API and transfer hosts.
#[derive(Default)]
pub struct MemoryMegaServer {
    state: Mutex<ServerState>,
}

fn code(value: i64) -> Value {
    json!(value)
}

impl MemoryMegaServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add_account(&self, email: &str, mut account: Account) {
        let mut state = self.lock();
        state.ensure_roots();
        account.user_handle = state.new_handle();
        state.accounts.insert(email.to_lowercase(), account);
    }

    /// Register an account using PBKDF2 key derivation.
    pub fn register(&self, email: &str, password: &str) -> Result<()> {
        let salt: Vec<u8> = (0..32).map(|_| rand::random::<u8>()).collect();
        let creds = derive_v2(password, &salt)?;
        let master = MasterKey::generate();
        let wrapped_master = wrap_master_key(&creds.password_key, &master)?;
        self.add_account(
            email,
            Account {
                version: 2,
                salt,
                user_hash: creds.user_hash,
                wrapped_master,
                master,
                user_handle: String::new(),
            },
        );
        Ok(())
    }

    /// Register an account using the legacy key schedule.
    pub fn register_v1(&self, email: &str, password: &str) -> Result<()> {
        let password_key = prepare_key_v1(password)?;
        let master = MasterKey::generate();
        let wrapped_master = wrap_master_key(&password_key, &master)?;
        self.add_account(
            email,
            Account {
                version: 1,
                salt: Vec::new(),
                user_hash: user_hash_v1(&email.to_lowercase(), &password_key),
                wrapped_master,
                master,
                user_handle: String::new(),
            },
        );
        Ok(())
    }

    /// Keep revoked links resolving for `lookups` more lookups.
    pub fn set_revocation_lag(&self, lookups: u32) {
        self.lock().revocation_lag = lookups;
    }

    /// Answer the next `count` commands with `EAGAIN`.
    pub fn fail_next(&self, count: u32) {
        self.lock().fail_next = count;
    }

    /// Flip one byte of a stored file's ciphertext.
    pub fn corrupt(&self, handle: &str) -> bool {
        let mut state = self.lock();
        let Some(node) = state.nodes.iter_mut().find(|n| n.handle == handle) else {
            return false;
        };
        let Some(content) = &node.content else {
            return false;
        };
        if content.is_empty() {
            return false;
        }
        let mut data = content.to_vec();
        data[0] ^= 0xff;
        node.content = Some(Bytes::from(data));
        true
    }

    /// Number of commands named `name` received so far.
    pub fn command_count(&self, name: &str) -> usize {
        self.lock().commands.iter().filter(|c| *c == name).count()
    }

    /// Number of stored nodes, roots included.
    pub fn node_count(&self) -> usize {
        self.lock().nodes.len()
    }

    fn handle_command(state: &mut ServerState, sid: Option<&str>, cmd: &Value) -> Value {
        let name = cmd.get("a").and_then(Value::as_str).unwrap_or_default();
        state.commands.push(name.to_string());

        match name {
            "us0" => Self::prelogin(state, cmd),
            "us" => Self::session_login(state, cmd),
            "g" if cmd.get("p").is_some() => Self::public_get(state, cmd),
            _ => {
                let Some(user) = sid.and_then(|s| state.sessions.get(s)).cloned() else {
                    return code(ESID);
                };
                match name {
                    "ug" => json!({"u": user}),
                    "f" => Self::fetch(state),
                    "p" => Self::put_nodes(state, &user, cmd),
                    "u" => Self::upload_slot(state, cmd),
                    "g" => Self::get(state, cmd),
                    "d" => Self::delete(state, cmd),
                    "l" => Self::link(state, cmd),
                    "sml" => {
                        if let Some(sid) = sid {
                            state.sessions.remove(sid);
                        }
                        json!(0)
                    }
                    _ => code(EARGS),
                }
            }
        }
    }

    fn prelogin(state: &ServerState, cmd: &Value) -> Value {
        let email = cmd.get("user").and_then(Value::as_str).unwrap_or_default();
        match state.accounts.get(email) {
            Some(account) if account.version == 2 => {
                json!({"v": 2, "s": base64url_encode(&account.salt)})
            }
            _ => json!({"v": 1}),
        }
    }

    fn session_login(state: &mut ServerState, cmd: &Value) -> Value {
        let email = cmd.get("user").and_then(Value::as_str).unwrap_or_default();
        let user_hash = cmd.get("uh").and_then(Value::as_str).unwrap_or_default();
        let Some(account) = state.accounts.get(email) else {
            return code(ENOENT);
        };
        if account.user_hash != user_hash {
            return code(ENOENT);
        }
        let Ok(tsid) = create_temporary_session(&account.master) else {
            return code(EARGS);
        };
        let response = json!({
            "k": base64url_encode(&account.wrapped_master),
            "tsid": base64url_encode(&tsid),
        });
        let user_handle = account.user_handle.clone();
        state.sessions.insert(base64url_encode(&tsid), user_handle);
        response
    }

    fn fetch(state: &ServerState) -> Value {
        let nodes: Vec<Value> = state.nodes.iter().map(StoredNode::to_json).collect();
        let links: Vec<Value> = state
            .links
            .iter()
            .map(|(ph, h)| json!({"h": h, "ph": ph}))
            .collect();
        json!({"f": nodes, "ph": links})
    }

    fn put_nodes(state: &mut ServerState, user: &str, cmd: &Value) -> Value {
        let parent = cmd.get("t").and_then(Value::as_str).unwrap_or_default();
        if state.node(parent).is_none() {
            return code(ENOENT);
        }
        let Some(new_nodes) = cmd.get("n").and_then(Value::as_array) else {
            return code(EARGS);
        };

        let mut created = Vec::new();
        for request in new_nodes {
            let kind = request.get("t").and_then(Value::as_i64).unwrap_or(-1);
            let content = match kind {
                0 => {
                    let completion = request.get("h").and_then(Value::as_str).unwrap_or_default();
                    match state.completed.remove(completion) {
                        Some(content) => Some(content),
                        None => return code(EARGS),
                    }
                }
                1 => None,
                _ => return code(EARGS),
            };
            let handle = state.new_handle();
            let node = StoredNode {
                handle,
                parent: Some(parent.to_string()),
                kind,
                attrs: request
                    .get("a")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                key: format!(
                    "{}:{}",
                    user,
                    request.get("k").and_then(Value::as_str).unwrap_or_default()
                ),
                content,
                ts: Utc::now().timestamp(),
            };
            created.push(node.to_json());
            state.nodes.push(node);
        }
        json!({"f": created})
    }

    fn upload_slot(state: &mut ServerState, cmd: &Value) -> Value {
        let Some(size) = cmd.get("s").and_then(Value::as_u64) else {
            return code(EARGS);
        };
        let id = state.new_handle();
        state.uploads.insert(
            id.clone(),
            PendingUpload {
                size,
                data: Vec::new(),
            },
        );
        json!({"p": format!("{}{}", UPLOAD_PREFIX, id)})
    }

    fn get(state: &ServerState, cmd: &Value) -> Value {
        let handle = cmd.get("n").and_then(Value::as_str).unwrap_or_default();
        match state.node(handle) {
            Some(StoredNode {
                content: Some(content),
                attrs,
                ..
            }) => json!({
                "g": format!("{}{}", DOWNLOAD_PREFIX, handle),
                "s": content.len(),
                "at": attrs,
            }),
            _ => code(ENOENT),
        }
    }

    fn public_get(state: &mut ServerState, cmd: &Value) -> Value {
        let public_handle = cmd.get("p").and_then(Value::as_str).unwrap_or_default();
        let target = match state.links.get(public_handle) {
            Some(handle) => handle.clone(),
            None => match state.revoked.get_mut(public_handle) {
                Some((remaining, handle)) if *remaining > 0 => {
                    *remaining -= 1;
                    handle.clone()
                }
                _ => return code(ENOENT),
            },
        };
        match state.node(&target) {
            Some(node) => json!({
                "s": node.content.as_ref().map_or(0, |c| c.len()),
                "at": node.attrs,
            }),
            None => code(ENOENT),
        }
    }

    fn delete(state: &mut ServerState, cmd: &Value) -> Value {
        let handle = cmd.get("n").and_then(Value::as_str).unwrap_or_default();
        if state.node(handle).is_none() {
            return code(ENOENT);
        }
        let doomed = state.descendants(handle);
        state.nodes.retain(|n| !doomed.contains(&n.handle));
        state.links.retain(|_, h| !doomed.contains(h));
        json!(0)
    }

    fn link(state: &mut ServerState, cmd: &Value) -> Value {
        let handle = cmd.get("n").and_then(Value::as_str).unwrap_or_default();
        if state.node(handle).is_none() {
            return code(ENOENT);
        }
        let existing = state
            .links
            .iter()
            .find(|(_, h)| *h == handle)
            .map(|(ph, _)| ph.clone());

        if cmd.get("d").and_then(Value::as_i64) == Some(1) {
            let Some(public_handle) = existing else {
                return code(ENOENT);
            };
            state.links.remove(&public_handle);
            let lag = state.revocation_lag;
            state
                .revoked
                .insert(public_handle, (lag, handle.to_string()));
            return json!(0);
        }

        let public_handle = match existing {
            Some(ph) => ph,
            None => {
                let ph = state.new_handle();
                state.links.insert(ph.clone(), handle.to_string());
                ph
            }
        };
        json!(public_handle)
    }

    fn receive_chunk(state: &mut ServerState, url: &str, data: &[u8]) -> String {
        let Some(rest) = url.strip_prefix(UPLOAD_PREFIX) else {
            return ENOENT.to_string();
        };
        let Some((id, offset)) = rest.split_once('/') else {
            return EARGS.to_string();
        };
        let Ok(offset) = offset.parse::<usize>() else {
            return EARGS.to_string();
        };
        let Some(upload) = state.uploads.get_mut(id) else {
            return EEXPIRED.to_string();
        };

        let end = offset + data.len();
        if end as u64 > upload.size {
            return EARGS.to_string();
        }
        if upload.data.len() < end {
            upload.data.resize(end, 0);
        }
        upload.data[offset..end].copy_from_slice(data);

        if upload.data.len() as u64 == upload.size {
            let Some(done) = state.uploads.remove(id) else {
                return EEXPIRED.to_string();
            };
            let completion = base64url_encode(&rand::random::<[u8; 27]>());
            state.completed.insert(completion.clone(), Bytes::from(done.data));
            return completion;
        }
        String::new()
    }
}

#[async_trait]
impl ApiTransport for MemoryMegaServer {
    async fn post_commands(&self, _seq: u64, sid: Option<&str>, body: Value) -> Result<Value> {
        let mut state = self.lock();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Ok(code(EAGAIN));
        }
        let Some(commands) = body.as_array() else {
            return Ok(code(EARGS));
        };

        if let Some(sid) = sid {
            if !state.sessions.contains_key(sid) {
                return Ok(code(ESID));
            }
        }
        let results: Vec<Value> = commands
            .iter()
            .map(|cmd| Self::handle_command(&mut state, sid, cmd))
            .collect();
        Ok(Value::Array(results))
    }

    async fn post_chunk(&self, url: &str, data: Bytes) -> Result<String> {
        Ok(Self::receive_chunk(&mut self.lock(), url, &data))
    }

    async fn get_stream(&self, url: &str) -> Result<ByteStream> {
        let rest = url
            .strip_prefix(DOWNLOAD_PREFIX)
            .ok_or_else(|| Error::NotFound(format!("Unknown download URL {}", url)))?;
        let (handle, range) = match rest.split_once('/') {
            Some((handle, range)) => (handle, Some(range)),
            None => (rest, None),
        };

        let content = self
            .lock()
            .node(handle)
            .and_then(|n| n.content.clone())
            .ok_or_else(|| Error::NotFound(format!("No content for {}", handle)))?;

        let content = match range {
            None => content,
            Some(range) => {
                let parsed = range
                    .split_once('-')
                    .and_then(|(s, e)| Some((s.parse::<usize>().ok()?, e.parse::<usize>().ok()?)));
                match parsed {
                    Some((start, end)) if start <= end && end < content.len() => {
                        content.slice(start..=end)
                    }
                    _ => return Err(Error::InvalidInput(format!("Bad range {}", range))),
                }
            }
        };

        let frames: Vec<Result<Bytes>> = content
            .chunks(FRAME_SIZE)
            .map(|frame| Ok(Bytes::copy_from_slice(frame)))
            .collect();
        Ok(Box::pin(futures::stream::iter(frames)))
    }
}
