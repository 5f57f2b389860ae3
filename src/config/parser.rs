//! Sectioned config parser (design component C7).
//!
//! Grammar (per source file):
//!
//! ```text
//! file       := (directive | block)*
//! directive  := "include" PATH | "includedir" PATH
//! block      := ("defaults" | "service" NAME) "{" entry* "}"
//! entry      := KEY OP value_list
//! OP         := "=" | "+=" | "-="
//! value_list := (STRING | QUOTED)+
//! ```
//!
//! Grounded on `libinetd/xinetd.cpp`'s attribute table (`{required, multi,
//! modifier-allowed, default-inheritable, max-arity, handler}` per key) and
//! on `networkd::config`'s hand-rolled INI reader for the surrounding
//! file-walking/line-tracking style (there is no off-the-shelf deserializer
//! for a brace-nested, operator-driven grammar with `$(VAR)` expansion).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::addr::{parse_addr, DefaultVerdict, NetAddr};
use crate::config::model::*;
use crate::error::InetdError;
use crate::geoip::{GeoField, GeoRule};
use crate::timewin::TimeAcl;

const MAX_EXPANSION_DEPTH: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Assign,
    Add,
    Sub,
}

#[derive(Debug, Clone)]
struct Entry {
    key: String,
    op: Op,
    values: Vec<String>,
    line: u32,
}

#[derive(Debug, Clone)]
struct RawBlock {
    /// `None` for the `defaults` block.
    name: Option<String>,
    entries: Vec<Entry>,
    #[allow(dead_code)]
    start_line: u32,
}

#[derive(Debug, Default)]
struct ParsedFile {
    defaults: Option<RawBlock>,
    services: Vec<RawBlock>,
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    LBrace,
    RBrace,
    Eq,
    PlusEq,
    MinusEq,
}

struct Lexed {
    tokens: Vec<(Token, u32)>,
}

fn lex(src: &str, file: &str) -> Result<Lexed, InetdError> {
    let mut tokens = Vec::new();
    let mut line: u32 = 1;
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0usize;

    let bad = |line: u32, reason: &str| InetdError::BadConfig {
        file: file.to_string(),
        line,
        reason: reason.to_string(),
    };

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => {
                line += 1;
                i += 1;
            }
            c if c.is_whitespace() => {
                i += 1;
            }
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '{' => {
                tokens.push((Token::LBrace, line));
                i += 1;
            }
            '}' => {
                tokens.push((Token::RBrace, line));
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                i += 1;
                let mut s = String::new();
                let start_line = line;
                loop {
                    if i >= chars.len() {
                        return Err(bad(start_line, "unterminated quoted string"));
                    }
                    let ch = chars[i];
                    if ch == '\\' && i + 1 < chars.len() && (chars[i + 1] == quote || chars[i + 1] == '\\') {
                        s.push(chars[i + 1]);
                        i += 2;
                        continue;
                    }
                    if ch == quote {
                        i += 1;
                        break;
                    }
                    if ch == '\n' {
                        line += 1;
                    }
                    s.push(ch);
                    i += 1;
                }
                tokens.push((Token::Word(s), start_line));
            }
            _ => {
                let start_line = line;
                let start = i;
                while i < chars.len() && !chars[i].is_whitespace() && chars[i] != '{' && chars[i] != '}' {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let tok = match word.as_str() {
                    "=" => Token::Eq,
                    "+=" => Token::PlusEq,
                    "-=" => Token::MinusEq,
                    _ => Token::Word(word),
                };
                tokens.push((tok, start_line));
            }
        }
    }
    Ok(Lexed { tokens })
}

// ---------------------------------------------------------------------------
// Grammar parser
// ---------------------------------------------------------------------------

struct TokenStream<'a> {
    tokens: &'a [(Token, u32)],
    pos: usize,
    file: String,
}

impl<'a> TokenStream<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_line(&self) -> u32 {
        self.tokens.get(self.pos).map(|(_, l)| *l).unwrap_or(0)
    }

    fn next(&mut self) -> Option<&(Token, u32)> {
        let t = self.tokens.get(self.pos);
        self.pos += 1;
        t
    }

    fn err(&self, line: u32, reason: impl Into<String>) -> InetdError {
        InetdError::BadConfig { file: self.file.clone(), line, reason: reason.into() }
    }
}

fn parse_block(ts: &mut TokenStream, name: Option<String>, start_line: u32) -> Result<RawBlock, InetdError> {
    match ts.next() {
        Some((Token::LBrace, _)) => {}
        other => {
            let line = other.map(|(_, l)| *l).unwrap_or(start_line);
            return Err(ts.err(line, "expected '{'"));
        }
    }

    let mut entries = Vec::new();
    loop {
        match ts.peek() {
            Some(Token::RBrace) => {
                ts.next();
                break;
            }
            None => return Err(ts.err(start_line, "unterminated block, missing '}'")),
            Some(Token::Word(_)) => {
                let key_line = ts.peek_line();
                let key = match ts.next() {
                    Some((Token::Word(w), _)) => w.clone(),
                    _ => unreachable!(),
                };
                let op = match ts.next() {
                    Some((Token::Eq, _)) => Op::Assign,
                    Some((Token::PlusEq, _)) => Op::Add,
                    Some((Token::MinusEq, _)) => Op::Sub,
                    other => {
                        let line = other.map(|(_, l)| *l).unwrap_or(key_line);
                        return Err(ts.err(line, format!("expected '=', '+=', or '-=' after {key:?}")));
                    }
                };
                let mut values = Vec::new();
                while let Some(Token::Word(_)) = ts.peek() {
                    if let Some((Token::Word(w), _)) = ts.next() {
                        values.push(w.clone());
                    }
                }
                entries.push(Entry { key, op, values, line: key_line });
            }
            Some(other) => {
                return Err(ts.err(ts.peek_line(), format!("unexpected token {other:?}")));
            }
        }
    }
    Ok(RawBlock { name, entries, start_line })
}

/// Parse one file's token stream into a `ParsedFile`, resolving `include`
/// / `includedir` directives relative to `base_dir`.
fn parse_tokens(lexed: &Lexed, file: &str, base_dir: &Path, out: &mut ParsedFile) -> Result<(), InetdError> {
    let mut ts = TokenStream { tokens: &lexed.tokens, pos: 0, file: file.to_string() };
    loop {
        let line = ts.peek_line();
        match ts.peek() {
            None => break,
            Some(Token::Word(w)) if w == "include" => {
                ts.next();
                let path = match ts.next() {
                    Some((Token::Word(p), _)) => p.clone(),
                    _ => return Err(ts.err(line, "include requires a path")),
                };
                include_file(&base_dir.join(path), out)?;
            }
            Some(Token::Word(w)) if w == "includedir" => {
                ts.next();
                let path = match ts.next() {
                    Some((Token::Word(p), _)) => p.clone(),
                    _ => return Err(ts.err(line, "includedir requires a path")),
                };
                include_dir(&base_dir.join(path), out)?;
            }
            Some(Token::Word(w)) if w == "defaults" => {
                ts.next();
                let block = parse_block(&mut ts, None, line)?;
                if out.defaults.is_some() {
                    return Err(ts.err(line, "only one defaults block is permitted"));
                }
                out.defaults = Some(block);
            }
            Some(Token::Word(w)) if w == "service" => {
                ts.next();
                let name = match ts.next() {
                    Some((Token::Word(n), _)) => n.clone(),
                    _ => return Err(ts.err(line, "service requires a name")),
                };
                let block = parse_block(&mut ts, Some(name), line)?;
                out.services.push(block);
            }
            Some(other) => {
                return Err(ts.err(line, format!("expected 'defaults', 'service', 'include', or 'includedir', found {other:?}")));
            }
        }
    }
    Ok(())
}

fn include_file(path: &Path, out: &mut ParsedFile) -> Result<(), InetdError> {
    let src = fs::read_to_string(path).map_err(|e| InetdError::BadConfig {
        file: path.display().to_string(),
        line: 0,
        reason: format!("cannot read include file: {e}"),
    })?;
    let file_str = path.display().to_string();
    let lexed = lex(&src, &file_str)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    parse_tokens(&lexed, &file_str, base, out)
}

fn include_dir(dir: &Path, out: &mut ParsedFile) -> Result<(), InetdError> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| InetdError::BadConfig {
            file: dir.display().to_string(),
            line: 0,
            reason: format!("cannot read includedir: {e}"),
        })?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    entries.sort();
    for path in entries {
        include_file(&path, out)?;
    }
    Ok(())
}

/// Parse the root config text (already read by the caller) plus any
/// `include`/`includedir` directives it contains, resolved relative to
/// `base_dir`.
fn parse_root(src: &str, file: &str, base_dir: &Path) -> Result<ParsedFile, InetdError> {
    let mut out = ParsedFile::default();
    let lexed = lex(src, file)?;
    parse_tokens(&lexed, file, base_dir, &mut out)?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// Attribute resolution ($(VAR) expansion, operator application)
// ---------------------------------------------------------------------------

fn raw_map(block: &RawBlock) -> HashMap<&str, Vec<&Entry>> {
    let mut m: HashMap<&str, Vec<&Entry>> = HashMap::new();
    for e in &block.entries {
        m.entry(e.key.as_str()).or_default().push(e);
    }
    m
}

fn expand_one(value: &str, defaults_raw: &HashMap<&str, Vec<&str>>, depth: u32, file: &str, line: u32) -> Result<String, InetdError> {
    if depth > MAX_EXPANSION_DEPTH {
        return Err(InetdError::BadConfig {
            file: file.to_string(),
            line,
            reason: "variable expansion nested too deeply (max 4 levels)".into(),
        });
    }
    if let Some(inner) = value.strip_prefix("$(").and_then(|s| s.strip_suffix(')')) {
        let Some(vals) = defaults_raw.get(inner) else {
            return Err(InetdError::BadConfig {
                file: file.to_string(),
                line,
                reason: format!("undefined variable $({inner})"),
            });
        };
        let joined = vals.join(" ");
        return expand_one(&joined, defaults_raw, depth + 1, file, line);
    }
    Ok(value.to_string())
}

/// Resolve one attribute's final value list: start from the defaults
/// block's list (if the attribute is default-inheritable and present
/// there), then apply `=`/`+=`/`-=` entries from the service block in
/// file order, expanding `$(VAR)` references along the way.
fn resolve_attr(
    key: &str,
    service_entries: Option<&Vec<&Entry>>,
    defaults_entries: Option<&Vec<&Entry>>,
    inheritable: bool,
    file: &str,
) -> Result<Vec<String>, InetdError> {
    let defaults_raw: HashMap<&str, Vec<&str>> = defaults_entries
        .map(|v| {
            let mut m: HashMap<&str, Vec<&str>> = HashMap::new();
            for e in v {
                m.entry(e.key.as_str()).or_default().extend(e.values.iter().map(String::as_str));
            }
            m
        })
        .unwrap_or_default();

    let mut acc: Vec<String> = if inheritable {
        defaults_entries
            .map(|entries| {
                let mut a = Vec::new();
                for e in entries.iter().filter(|e| e.key == key) {
                    let vals: Vec<String> = e
                        .values
                        .iter()
                        .map(|v| expand_one(v, &defaults_raw, 0, file, e.line))
                        .collect::<Result<_, _>>()?;
                    match e.op {
                        Op::Assign => a = vals,
                        Op::Add => a.extend(vals),
                        Op::Sub => a.retain(|x| !vals.contains(x)),
                    }
                }
                Ok::<_, InetdError>(a)
            })
            .transpose()?
            .unwrap_or_default()
    } else {
        Vec::new()
    };

    if let Some(entries) = service_entries {
        for e in entries.iter().filter(|e| e.key == key) {
            let vals: Vec<String> = e
                .values
                .iter()
                .map(|v| expand_one(v, &defaults_raw, 0, file, e.line))
                .collect::<Result<_, _>>()?;
            match e.op {
                Op::Assign => acc = vals,
                Op::Add => acc.extend(vals),
                Op::Sub => acc.retain(|x| !vals.contains(x)),
            }
        }
    }
    Ok(acc)
}

// ---------------------------------------------------------------------------
// Typed attribute builders
// ---------------------------------------------------------------------------

fn single(vals: &[String]) -> Option<&str> {
    vals.first().map(String::as_str)
}

fn bad(file: &str, line: u32, reason: impl Into<String>) -> InetdError {
    InetdError::BadConfig { file: file.to_string(), line, reason: reason.into() }
}

fn parse_only_no_access(vals: &[String], file: &str, line: u32) -> Result<(Vec<(bool, NetAddr)>, Option<DefaultVerdict>), InetdError> {
    let mut rules = Vec::new();
    let mut default = None;
    let mut i = 0;
    while i < vals.len() {
        let tok = vals[i].as_str();
        if tok.eq_ignore_ascii_case("ALL") {
            default = Some(DefaultVerdict::AllowAll);
            i += 1;
            continue;
        }
        if tok.eq_ignore_ascii_case("FILE") {
            i += 1;
            let path = vals.get(i).ok_or_else(|| bad(file, line, "FILE requires a path"))?;
            for line_text in fs::read_to_string(path)
                .map_err(|e| bad(file, line, format!("cannot read address file {path:?}: {e}")))?
                .lines()
            {
                let line_text = line_text.trim();
                if line_text.is_empty() || line_text.starts_with('#') {
                    continue;
                }
                rules.push(parse_addr(line_text, true)?);
            }
            i += 1;
            continue;
        }
        rules.push(parse_addr(tok, true)?);
        i += 1;
    }
    Ok((rules.into_iter().map(|n| (true, n)).collect(), default))
}

fn build_ip_acl(
    only_from: &[String],
    no_access: &[String],
    file: &str,
    line: u32,
) -> Result<IpAclConfig, InetdError> {
    let (allow_rules, allow_default) = parse_only_no_access(only_from, file, line)?;
    let (deny_rules, deny_default) = parse_only_no_access(no_access, file, line)?;

    if allow_default.is_some() && deny_default.is_some() {
        return Err(bad(file, line, "only_from=ALL and no_access=ALL are mutually exclusive"));
    }

    let mut rules: Vec<(bool, NetAddr)> = allow_rules;
    rules.extend(deny_rules.into_iter().map(|(_, n)| (false, n)));

    let default = if allow_default.is_some() {
        DefaultVerdict::AllowAll
    } else if deny_default.is_some() {
        DefaultVerdict::DenyAll
    } else {
        DefaultVerdict::Unset
    };

    Ok(IpAclConfig { rules, default })
}

fn build_geoip(allow: &[String], deny: &[String], database: Option<PathBuf>, file: &str, line: u32) -> Result<GeoIpConfig, InetdError> {
    fn parse_rules(vals: &[String], allow: bool, file: &str, line: u32) -> Result<(Vec<GeoRule>, Option<DefaultVerdict>), InetdError> {
        let mut rules = Vec::new();
        let mut default = None;
        let mut i = 0;
        while i < vals.len() {
            let tok = vals[i].as_str();
            if tok.eq_ignore_ascii_case("ALL") {
                default = Some(if allow { DefaultVerdict::AllowAll } else { DefaultVerdict::DenyAll });
                i += 1;
                continue;
            }
            let field = match tok.to_lowercase().as_str() {
                "city" => GeoField::City,
                "timezone" => GeoField::Timezone,
                "country" => GeoField::Country,
                "continent" => GeoField::Continent,
                _ => return Err(bad(file, line, format!("unknown geoip field {tok:?}"))),
            };
            i += 1;
            let value = vals.get(i).ok_or_else(|| bad(file, line, "geoip rule missing value"))?;
            rules.push(GeoRule { field, value: value.clone(), allow });
            i += 1;
        }
        Ok((rules, default))
    }

    let (allow_rules, allow_default) = parse_rules(allow, true, file, line)?;
    let (deny_rules, deny_default) = parse_rules(deny, false, file, line)?;
    if allow_default.is_some() && deny_default.is_some() {
        return Err(bad(file, line, "geoip_allow=ALL and geoip_deny=ALL are mutually exclusive"));
    }
    let mut rules = allow_rules;
    rules.extend(deny_rules);
    let default = allow_default.or(deny_default).unwrap_or(DefaultVerdict::Unset);
    Ok(GeoIpConfig { rules, database, default })
}

/// Build one `ServiceConfig` from a raw `service {...}` block plus the
/// resolved `defaults` block.
fn build_service(block: &RawBlock, defaults: Option<&RawBlock>, file: &str) -> Result<ServiceConfig, InetdError> {
    let name = block.name.clone().expect("service block always named");
    let svc_map = raw_map(block);
    let def_map = defaults.map(raw_map);

    let get = |key: &str, inheritable: bool| -> Result<Vec<String>, InetdError> {
        resolve_attr(key, svc_map.get(key), def_map.as_ref().and_then(|m| m.get(key)), inheritable, file)
    };

    let line = block.start_line;

    let socket_type = get("socket_type", true)?;
    let socket_kind = match single(&socket_type).ok_or_else(|| bad(file, line, format!("service {name:?}: socket_type is required")))? {
        "stream" => SocketKind::Stream,
        "dgram" => SocketKind::Dgram,
        "raw" => SocketKind::Raw,
        "rdm" => SocketKind::Rdm,
        "seqpacket" => SocketKind::SeqPacket,
        other => return Err(bad(file, line, format!("service {name:?}: unknown socket_type {other:?}"))),
    };

    let flags = get("flags", true)?;
    let want_v6 = flags.iter().any(|f| f.eq_ignore_ascii_case("IPv6"));
    let want_v4 = flags.iter().any(|f| f.eq_ignore_ascii_case("IPv4"));
    if want_v4 && want_v6 {
        return Err(bad(file, line, format!("service {name:?}: IPv4 and IPv6 flags are mutually exclusive")));
    }

    let protocol_raw = get("protocol", true)?;
    let mut protocol = single(&protocol_raw).map(str::to_string).unwrap_or_else(|| match socket_kind {
        SocketKind::Stream | SocketKind::SeqPacket => "tcp".to_string(),
        SocketKind::Dgram => "udp".to_string(),
        _ => "tcp".to_string(),
    });
    let mut rpc = false;
    if let Some(stripped) = protocol.strip_prefix("rpc/") {
        rpc = true;
        protocol = stripped.to_string();
    }
    let family = if protocol == "unix" {
        SockFamily::Unix
    } else if let Some(stripped) = protocol.strip_suffix('6') {
        protocol = stripped.to_string();
        SockFamily::V6
    } else if let Some(stripped) = protocol.strip_suffix('4') {
        protocol = stripped.to_string();
        SockFamily::V4
    } else if want_v6 {
        SockFamily::V6
    } else {
        SockFamily::V4
    };

    let wait_raw = get("wait", true)?;
    let wait = match single(&wait_raw) {
        Some("yes") => WaitMode::Single,
        Some("no") => WaitMode::Multi,
        Some(other) => return Err(bad(file, line, format!("service {name:?}: invalid wait={other:?}"))),
        None => return Err(bad(file, line, format!("service {name:?}: wait is required"))),
    };
    let wait = if protocol == "tcpmux" { WaitMode::Multi } else { wait };

    let user = single(&get("user", true)?).map(str::to_string).unwrap_or_default();
    let group = single(&get("group", true)?).map(str::to_string);
    let login_class = single(&get("login_class", true)?).map(str::to_string);

    let port_raw = get("port", true)?;
    let port = single(&port_raw).map(|p| p.parse::<u16>()).transpose().map_err(|_| bad(file, line, "invalid port"))?;

    let unix_path = single(&get("socket_path", true)?).map(PathBuf::from);

    let server = single(&get("server", true)?).map(PathBuf::from);
    let server_args = get("server_args", true)?;
    let builtin_name = single(&get("builtin", true)?).map(str::to_string);
    let redirect = get("redirect", true)?;

    let handler = if let Some(name) = builtin_name {
        let bi_fork = flags.iter().any(|f| f.eq_ignore_ascii_case("BIFORK"));
        Handler::Builtin { name, bi_fork }
    } else if !redirect.is_empty() {
        let spec = &redirect[0];
        let (host, port_s) = spec.split_once(':').ok_or_else(|| bad(file, line, "redirect requires host:port"))?;
        let port: u16 = port_s.parse().map_err(|_| bad(file, line, "invalid redirect port"))?;
        Handler::Redirect { host: host.to_string(), port }
    } else if let Some(path) = server {
        if server_args.len() > 20 {
            return Err(bad(file, line, format!("service {name:?}: argv exceeds 20 entries")));
        }
        let workdir = single(&get("server_workdir", true)?).map(PathBuf::from);
        Handler::External { path, args: server_args, workdir }
    } else {
        return Err(bad(file, line, format!("service {name:?}: requires exactly one of server/builtin/redirect")));
    };

    let instances_raw = get("instances", true)?;
    let max_child: u32 = match single(&instances_raw) {
        Some("UNLIMITED") | None => 0,
        Some(n) => n.parse().map_err(|_| bad(file, line, "invalid instances"))?,
    };

    let per_source_raw = get("per_source", true)?;
    let per_source: u32 = match single(&per_source_raw) {
        Some("UNLIMITED") | None => 0,
        Some(n) => n.parse().map_err(|_| bad(file, line, "invalid per_source"))?,
    };

    let cpm_raw = get("cpm", true)?;
    let cpm_max: u32 = cpm_raw.first().map(|s| s.parse()).transpose().map_err(|_| bad(file, line, "invalid cpm max"))?.unwrap_or(0);
    let cpm_wait_secs: u32 = cpm_raw.get(1).map(|s| s.parse()).transpose().map_err(|_| bad(file, line, "invalid cpm wait"))?.unwrap_or(0);

    let times_raw = get("access_times", true)?;
    let mut access_times = TimeAcl::new();
    for t in &times_raw {
        access_times.insert(TimeAcl::parse_window(t)?)?;
    }

    let only_from = get("only_from", true)?;
    let no_access = get("no_access", true)?;
    let ip_acl = build_ip_acl(&only_from, &no_access, file, line)?;

    let geoip_allow = get("geoip_allow", true)?;
    let geoip_deny = get("geoip_deny", true)?;
    let geoip_db = single(&get("geoip_database", true)?).map(PathBuf::from);
    let geoip = build_geoip(&geoip_allow, &geoip_deny, geoip_db, file, line)?;

    let env_lines = get("env", true)?;
    let mut env_set = Vec::new();
    for e in &env_lines {
        let (k, v) = e.split_once('=').ok_or_else(|| bad(file, line, format!("invalid env entry {e:?}, must contain '='")))?;
        env_set.push((k.to_string(), v.to_string()));
    }
    let passenv = get("passenv", true)?;

    let rcvbuf = single(&get("rcvbuf", true)?).map(|s| s.parse()).transpose().map_err(|_| bad(file, line, "invalid rcvbuf"))?;
    let sndbuf = single(&get("sndbuf", true)?).map(|s| s.parse()).transpose().map_err(|_| bad(file, line, "invalid sndbuf"))?;

    let banners = Banners {
        generic: single(&get("banner", true)?).map(PathBuf::from),
        success: single(&get("banner_success", true)?).map(PathBuf::from),
        failure: single(&get("banner_fail", true)?).map(PathBuf::from),
    };

    let ipsec_policy = single(&get("ipsec", true)?).map(str::to_string);

    let disable_raw = get("disable", true)?;
    let local_disable: Option<bool> = match single(&disable_raw) {
        Some("yes") => Some(true),
        Some("no") => Some(false),
        Some(other) => return Err(bad(file, line, format!("invalid disable={other:?}"))),
        None => None,
    };

    // Open Question, decided (see SPEC_FULL.md / DESIGN.md): a local
    // `disable = yes|no` always wins over the defaults-block `enabled`
    // whitelist; whitelist absence only disables a service when the
    // service has no local `disable` entry at all.
    let enabled_whitelist = defaults.map(|d| raw_map(d)).and_then(|m| m.get("enabled").cloned());
    let disabled = if let Some(local) = local_disable {
        local
    } else if let Some(list) = enabled_whitelist {
        !list.iter().any(|e| e.values.iter().any(|v| v == &name))
    } else {
        false
    };

    let svc = ServiceConfig {
        name,
        socket_kind,
        family,
        protocol,
        rpc,
        port,
        unix_path,
        wait,
        identity: Identity { user, group, login_class },
        handler,
        env: EnvPolicy { passenv, set: env_set },
        rcvbuf,
        sndbuf,
        max_child,
        cpm_max,
        cpm_wait_secs,
        per_source,
        access_times,
        ip_acl,
        geoip,
        banners,
        ipsec_policy,
        disabled,
    };
    svc.validate().map_err(|reason| bad(file, line, reason))?;
    Ok(svc)
}

/// Parse a whole configuration tree rooted at `path`, returning every
/// `ServiceConfig` it defines. The first error encountered is returned
/// (the design calls for preserving the first error while best-effort
/// continuing to collect later ones for the log; `errors_seen` receives
/// every subsequent per-service failure so callers can log them all).
pub fn parse_file(path: &Path, errors_seen: &mut Vec<InetdError>) -> Result<Vec<ServiceConfig>, InetdError> {
    let src = fs::read_to_string(path).map_err(|e| InetdError::BadConfig {
        file: path.display().to_string(),
        line: 0,
        reason: format!("cannot read {}: {e}", path.display()),
    })?;
    let file_str = path.display().to_string();
    let base_dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    let parsed = parse_root(&src, &file_str, &base_dir)?;

    let mut services = Vec::new();
    let mut first_err = None;
    for block in &parsed.services {
        match build_service(block, parsed.defaults.as_ref(), &file_str) {
            Ok(svc) => services.push(svc),
            Err(e) => {
                if first_err.is_none() {
                    first_err = Some(e.clone_display());
                }
                errors_seen.push(e);
            }
        }
    }
    if let Some(e) = first_err {
        return Err(e);
    }
    Ok(services)
}

// Small helper: `InetdError` doesn't derive `Clone` everywhere (it wraps
// `std::io::Error`), so config-parse errors — which never carry an
// `io::Error` — get a cheap re-synthesis instead of a `Clone` bound.
trait CloneDisplay {
    fn clone_display(&self) -> InetdError;
}

impl CloneDisplay for InetdError {
    fn clone_display(&self) -> InetdError {
        InetdError::BadConfig { file: String::new(), line: 0, reason: self.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn parses_minimal_service() {
        let f = write_tmp(
            r#"
            service echo
            {
                socket_type = stream
                protocol    = tcp
                wait        = no
                user        = nobody
                port        = 7007
                builtin     = echo
            }
            "#,
        );
        let mut errs = Vec::new();
        let services = parse_file(f.path(), &mut errs).unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].name, "echo");
        assert_eq!(services[0].port, Some(7007));
        assert_eq!(services[0].wait, WaitMode::Multi);
    }

    #[test]
    fn defaults_inherit_and_override() {
        let f = write_tmp(
            r#"
            defaults
            {
                instances = 10
                only_from = 10.0.0.0/8
            }
            service a
            {
                socket_type = stream
                protocol = tcp
                wait = no
                user = nobody
                port = 1
                builtin = echo
                instances -= 10
                instances += 5
            }
            "#,
        );
        let mut errs = Vec::new();
        let services = parse_file(f.path(), &mut errs).unwrap();
        assert_eq!(services[0].max_child, 5);
        assert_eq!(services[0].ip_acl.rules.len(), 1);
    }

    #[test]
    fn variable_expansion() {
        let f = write_tmp(
            r#"
            defaults
            {
                log_type = SYSLOG
            }
            service a
            {
                socket_type = stream
                protocol = tcp
                wait = no
                user = $(log_type)
                port = 1
                builtin = echo
            }
            "#,
        );
        let mut errs = Vec::new();
        let services = parse_file(f.path(), &mut errs).unwrap();
        assert_eq!(services[0].identity.user, "SYSLOG");
    }

    #[test]
    fn only_from_all_sets_default_verdict() {
        let f = write_tmp(
            r#"
            service a
            {
                socket_type = stream
                protocol = tcp
                wait = no
                user = nobody
                port = 1
                builtin = echo
                only_from = ALL
            }
            "#,
        );
        let mut errs = Vec::new();
        let services = parse_file(f.path(), &mut errs).unwrap();
        assert_eq!(services[0].ip_acl.default, DefaultVerdict::AllowAll);
    }

    #[test]
    fn conflicting_all_defaults_rejected() {
        let f = write_tmp(
            r#"
            service a
            {
                socket_type = stream
                protocol = tcp
                wait = no
                user = nobody
                port = 1
                builtin = echo
                only_from = ALL
                no_access = ALL
            }
            "#,
        );
        let mut errs = Vec::new();
        assert!(parse_file(f.path(), &mut errs).is_err());
    }

    #[test]
    fn local_disable_wins_over_enabled_whitelist() {
        let f = write_tmp(
            r#"
            defaults
            {
                enabled = b
            }
            service a
            {
                socket_type = stream
                protocol = tcp
                wait = no
                user = nobody
                port = 1
                builtin = echo
                disable = no
            }
            "#,
        );
        let mut errs = Vec::new();
        let services = parse_file(f.path(), &mut errs).unwrap();
        assert!(!services[0].disabled);
    }

    #[test]
    fn missing_from_whitelist_disables_without_local_override() {
        let f = write_tmp(
            r#"
            defaults
            {
                enabled = b
            }
            service a
            {
                socket_type = stream
                protocol = tcp
                wait = no
                user = nobody
                port = 1
                builtin = echo
            }
            "#,
        );
        let mut errs = Vec::new();
        let services = parse_file(f.path(), &mut errs).unwrap();
        assert!(services[0].disabled);
    }

    #[test]
    fn missing_socket_type_is_an_error() {
        let f = write_tmp(
            r#"
            service a
            {
                protocol = tcp
                wait = no
                user = nobody
                port = 1
                builtin = echo
            }
            "#,
        );
        let mut errs = Vec::new();
        assert!(parse_file(f.path(), &mut errs).is_err());
    }

    #[test]
    fn rpc_prefix_sets_flag_and_strips_protocol() {
        let f = write_tmp(
            r#"
            service a
            {
                socket_type = dgram
                protocol = rpc/udp
                wait = yes
                user = nobody
                port = 1
                builtin = echo
            }
            "#,
        );
        let mut errs = Vec::new();
        let services = parse_file(f.path(), &mut errs).unwrap();
        assert!(services[0].rpc);
        assert_eq!(services[0].protocol, "udp");
    }
}
