//! Policy-message schema and parser.
//!
//! Control payloads are small (<= 512 bytes) JSON objects applied to a single
//! pid. The parser is hand-rolled over string slices so every rejection maps
//! to a precise ack code with the offending field in the detail, which a
//! general-purpose JSON deserializer cannot express.

pub const MAX_PAYLOAD_SIZE: usize = 512;
pub const MAX_GROUP_ID_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckCode {
    Ack,
    NackInvalidPayload,
    NackInvalidPid,
    NackInvalidRange,
    NackParseError,
    NackUnknownField,
    NackQueueFull,
    NackProcessDead,
}

impl AckCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckCode::Ack => "ACK",
            AckCode::NackInvalidPayload => "NACK_INVALID_PAYLOAD",
            AckCode::NackInvalidPid => "NACK_INVALID_PID",
            AckCode::NackInvalidRange => "NACK_INVALID_RANGE",
            AckCode::NackParseError => "NACK_PARSE_ERROR",
            AckCode::NackUnknownField => "NACK_UNKNOWN_FIELD",
            AckCode::NackQueueFull => "NACK_QUEUE_FULL",
            AckCode::NackProcessDead => "NACK_PROCESS_DEAD",
        }
    }
}

impl std::fmt::Display for AckCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a governed process should get when it violates its group policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationAction {
    Notify,
    Throttle,
    Kill,
}

impl ViolationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationAction::Notify => "notify",
            ViolationAction::Throttle => "throttle",
            ViolationAction::Kill => "kill",
        }
    }

    pub fn parse(s: &str) -> Option<ViolationAction> {
        match s {
            "notify" => Some(ViolationAction::Notify),
            "throttle" => Some(ViolationAction::Throttle),
            "kill" => Some(ViolationAction::Kill),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuPolicy {
    pub affinity: Option<String>,
    pub nice: Option<i8>,
    pub max_pct: Option<u8>,
    pub quota_us: Option<u32>,
    pub period_us: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemPolicy {
    pub max_bytes: Option<u64>,
    pub high_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PidsPolicy {
    pub max: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RlimPolicy {
    pub nofile_soft: Option<u64>,
    pub nofile_hard: Option<u64>,
    pub core_soft: Option<u64>,
    pub core_hard: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeoutsPolicy {
    pub apply_deadline_ms: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GovApplyMsg {
    pub pid: i32,
    pub group: Option<String>,
    pub cpu: Option<CpuPolicy>,
    pub mem: Option<MemPolicy>,
    pub pids: Option<PidsPolicy>,
    pub rlim: Option<RlimPolicy>,
    pub oom_score_adj: Option<i32>,
    pub timeouts: Option<TimeoutsPolicy>,
    pub action: Option<ViolationAction>,
}

#[derive(Debug, Clone)]
pub struct ParseResult {
    pub ok: bool,
    pub ack: AckCode,
    pub msg: GovApplyMsg,
    pub detail: String,
}

impl ParseResult {
    fn rejected(ack: AckCode, detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            ack,
            msg: GovApplyMsg::default(),
            detail: detail.into(),
        }
    }
}

/// Bitmask over the per-PID policy schema; reports which primitives a message
/// actually committed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyFields(pub u8);

impl ApplyFields {
    pub const CPU_AFFINITY: u8 = 1 << 0;
    pub const CPU_NICE: u8 = 1 << 1;
    pub const CPU_MAX_PCT: u8 = 1 << 2;
    pub const MEM_MAX_BYTES: u8 = 1 << 3;
    pub const PIDS_MAX: u8 = 1 << 4;
    pub const RLIM_NOFILE: u8 = 1 << 5;
    pub const RLIM_CORE: u8 = 1 << 6;
    pub const OOM_SCORE_ADJ: u8 = 1 << 7;

    pub fn set(&mut self, bit: u8) {
        self.0 |= bit;
    }

    pub fn has(&self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    pub fn merge(&mut self, other: ApplyFields) {
        self.0 |= other.0;
    }
}

enum Reject {
    Payload(String),
    Pid(String),
    Range(String),
    Parse(String),
    Unknown(String),
}

impl Reject {
    fn ack(&self) -> AckCode {
        match self {
            Reject::Payload(_) => AckCode::NackInvalidPayload,
            Reject::Pid(_) => AckCode::NackInvalidPid,
            Reject::Range(_) => AckCode::NackInvalidRange,
            Reject::Parse(_) => AckCode::NackParseError,
            Reject::Unknown(_) => AckCode::NackUnknownField,
        }
    }

    fn detail(self) -> String {
        match self {
            Reject::Payload(d)
            | Reject::Pid(d)
            | Reject::Range(d)
            | Reject::Parse(d)
            | Reject::Unknown(d) => d,
        }
    }
}

type PResult<T> = Result<T, Reject>;

fn is_ws(c: char) -> bool {
    c == ' ' || c == '\t' || c == '\n' || c == '\r'
}

fn skip_ws(s: &mut &str) {
    *s = s.trim_start_matches(is_ws);
}

fn trim(s: &str) -> &str {
    s.trim_matches(is_ws)
}

fn parse_quoted(s: &mut &str, what: &str) -> PResult<String> {
    skip_ws(s);
    let rest = s
        .strip_prefix('"')
        .ok_or_else(|| Reject::Parse(format!("expected string for {what}")))?;
    let bytes = rest.as_bytes();
    let mut i = 0;
    while i < bytes.len() && bytes[i] != b'"' {
        if bytes[i] == b'\\' && i + 1 < bytes.len() {
            i += 2;
        } else {
            i += 1;
        }
    }
    if i >= bytes.len() {
        return Err(Reject::Parse(format!("unterminated string for {what}")));
    }
    let val = rest[..i].to_string();
    *s = &rest[i + 1..];
    Ok(val)
}

/// Strict signed integer. A fractional literal in an integer position is a
/// parse error, not a truncation.
fn parse_int(s: &mut &str, what: &str) -> PResult<i64> {
    skip_ws(s);
    let bytes = s.as_bytes();
    let mut end = 0;
    if end < bytes.len() && bytes[end] == b'-' {
        end += 1;
    }
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end == digits_start {
        return Err(Reject::Parse(format!("expected integer for {what}")));
    }
    if end < bytes.len() && bytes[end] == b'.' {
        return Err(Reject::Parse(format!("fractional value for {what}")));
    }
    let val: i64 = s[..end]
        .parse()
        .map_err(|_| Reject::Parse(format!("integer out of range for {what}")))?;
    *s = &s[end..];
    Ok(val)
}

fn parse_uint(s: &mut &str, what: &str) -> PResult<u64> {
    skip_ws(s);
    let bytes = s.as_bytes();
    let mut end = 0;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end == 0 {
        return Err(Reject::Parse(format!("expected unsigned integer for {what}")));
    }
    if end < bytes.len() && bytes[end] == b'.' {
        return Err(Reject::Parse(format!("fractional value for {what}")));
    }
    let val: u64 = s[..end]
        .parse()
        .map_err(|_| Reject::Parse(format!("integer out of range for {what}")))?;
    *s = &s[end..];
    Ok(val)
}

fn parse_u32(s: &mut &str, what: &str) -> PResult<u32> {
    let v = parse_uint(s, what)?;
    u32::try_from(v).map_err(|_| Reject::Range(format!("{what} out of range")))
}

fn consume_colon(s: &mut &str) -> PResult<()> {
    skip_ws(s);
    *s = s
        .strip_prefix(':')
        .ok_or_else(|| Reject::Parse("missing colon after key".to_string()))?;
    Ok(())
}

fn consume_comma(s: &mut &str) {
    skip_ws(s);
    if let Some(rest) = s.strip_prefix(',') {
        *s = trim(rest);
    }
}

/// Slice out one balanced `{...}` object and return its interior.
fn take_object<'a>(s: &mut &'a str, what: &str) -> PResult<&'a str> {
    skip_ws(s);
    if !s.starts_with('{') {
        return Err(Reject::Parse(format!("{what} must be an object")));
    }
    let bytes = s.as_bytes();
    let mut depth = 0usize;
    let mut end = 0usize;
    for (i, b) in bytes.iter().enumerate() {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    end = i + 1;
                    break;
                }
            }
            _ => {}
        }
    }
    if end == 0 {
        return Err(Reject::Parse(format!("unterminated {what} object")));
    }
    let inner = trim(&s[1..end - 1]);
    *s = &s[end..];
    Ok(inner)
}

fn parse_cpu(obj: &str) -> PResult<CpuPolicy> {
    let mut s = obj;
    let mut cpu = CpuPolicy::default();
    while !s.is_empty() {
        let key = parse_quoted(&mut s, "cpu key")?;
        consume_colon(&mut s)?;
        match key.as_str() {
            "affinity" => cpu.affinity = Some(parse_quoted(&mut s, "cpu.affinity")?),
            "nice" => {
                let v = parse_int(&mut s, "cpu.nice")?;
                if !(-128..=127).contains(&v) {
                    return Err(Reject::Range("cpu.nice out of range (-128 to 127)".into()));
                }
                cpu.nice = Some(v as i8);
            }
            "max_pct" => {
                let v = parse_uint(&mut s, "cpu.max_pct")?;
                if v > 100 {
                    return Err(Reject::Range("cpu.max_pct out of range (0-100)".into()));
                }
                cpu.max_pct = Some(v as u8);
            }
            "quota_us" => {
                let v = parse_u32(&mut s, "cpu.quota_us")?;
                if v == 0 {
                    return Err(Reject::Range("cpu.quota_us must be positive".into()));
                }
                cpu.quota_us = Some(v);
            }
            "period_us" => {
                let v = parse_u32(&mut s, "cpu.period_us")?;
                if v == 0 {
                    return Err(Reject::Range("cpu.period_us must be positive".into()));
                }
                cpu.period_us = Some(v);
            }
            other => return Err(Reject::Unknown(format!("unknown cpu field: {other}"))),
        }
        consume_comma(&mut s);
    }
    Ok(cpu)
}

fn parse_mem(obj: &str) -> PResult<MemPolicy> {
    let mut s = obj;
    let mut mem = MemPolicy::default();
    while !s.is_empty() {
        let key = parse_quoted(&mut s, "mem key")?;
        consume_colon(&mut s)?;
        match key.as_str() {
            "max_bytes" => mem.max_bytes = Some(parse_uint(&mut s, "mem.max_bytes")?),
            "high_bytes" => mem.high_bytes = Some(parse_uint(&mut s, "mem.high_bytes")?),
            other => return Err(Reject::Unknown(format!("unknown mem field: {other}"))),
        }
        consume_comma(&mut s);
    }
    Ok(mem)
}

fn parse_pids(obj: &str) -> PResult<PidsPolicy> {
    let mut s = obj;
    let mut pids = PidsPolicy::default();
    while !s.is_empty() {
        let key = parse_quoted(&mut s, "pids key")?;
        consume_colon(&mut s)?;
        match key.as_str() {
            "max" => {
                let v = parse_uint(&mut s, "pids.max")?;
                let v =
                    u32::try_from(v).map_err(|_| Reject::Range("pids.max out of range".into()))?;
                pids.max = Some(v);
            }
            other => return Err(Reject::Unknown(format!("unknown pids field: {other}"))),
        }
        consume_comma(&mut s);
    }
    Ok(pids)
}

fn parse_rlim(obj: &str) -> PResult<RlimPolicy> {
    let mut s = obj;
    let mut rlim = RlimPolicy::default();
    while !s.is_empty() {
        let key = parse_quoted(&mut s, "rlim key")?;
        consume_colon(&mut s)?;
        match key.as_str() {
            "nofile_soft" => rlim.nofile_soft = Some(parse_uint(&mut s, "rlim.nofile_soft")?),
            "nofile_hard" => rlim.nofile_hard = Some(parse_uint(&mut s, "rlim.nofile_hard")?),
            "core_soft" => rlim.core_soft = Some(parse_uint(&mut s, "rlim.core_soft")?),
            "core_hard" => rlim.core_hard = Some(parse_uint(&mut s, "rlim.core_hard")?),
            other => return Err(Reject::Unknown(format!("unknown rlim field: {other}"))),
        }
        consume_comma(&mut s);
    }
    Ok(rlim)
}

fn parse_timeouts(obj: &str) -> PResult<TimeoutsPolicy> {
    let mut s = obj;
    let mut t = TimeoutsPolicy::default();
    while !s.is_empty() {
        let key = parse_quoted(&mut s, "timeouts key")?;
        consume_colon(&mut s)?;
        match key.as_str() {
            "apply_deadline_ms" => {
                t.apply_deadline_ms = Some(parse_u32(&mut s, "timeouts.apply_deadline_ms")?)
            }
            other => return Err(Reject::Unknown(format!("unknown timeouts field: {other}"))),
        }
        consume_comma(&mut s);
    }
    Ok(t)
}

fn parse_body(payload: &str) -> PResult<GovApplyMsg> {
    let mut s = trim(payload);
    if !s.starts_with('{') || !s.ends_with('}') {
        return Err(Reject::Parse("expected JSON object".into()));
    }
    s = trim(&s[1..s.len() - 1]);

    let mut msg = GovApplyMsg::default();
    let mut has_pid = false;

    while !s.is_empty() {
        let key = parse_quoted(&mut s, "key")?;
        consume_colon(&mut s)?;
        // Duplicate keys take the last value.
        match key.as_str() {
            "pid" => {
                let v = parse_int(&mut s, "pid")?;
                if v <= 0 {
                    return Err(Reject::Pid("pid must be positive".into()));
                }
                let v = i32::try_from(v).map_err(|_| Reject::Pid("pid out of range".into()))?;
                msg.pid = v;
                has_pid = true;
            }
            "group" => {
                let g = parse_quoted(&mut s, "group")?;
                if g.is_empty() || g.len() > MAX_GROUP_ID_LEN {
                    return Err(Reject::Range(format!(
                        "group id must be 1-{MAX_GROUP_ID_LEN} bytes"
                    )));
                }
                if !g.bytes().all(|b| (0x21..=0x7e).contains(&b)) {
                    return Err(Reject::Range("group id must be printable ASCII".into()));
                }
                msg.group = Some(g);
            }
            "cpu" => msg.cpu = Some(parse_cpu(take_object(&mut s, "cpu")?)?),
            "mem" => msg.mem = Some(parse_mem(take_object(&mut s, "mem")?)?),
            "pids" => msg.pids = Some(parse_pids(take_object(&mut s, "pids")?)?),
            "rlim" => msg.rlim = Some(parse_rlim(take_object(&mut s, "rlim")?)?),
            "timeouts" => msg.timeouts = Some(parse_timeouts(take_object(&mut s, "timeouts")?)?),
            "oom_score_adj" => {
                let v = parse_int(&mut s, "oom_score_adj")?;
                if !(-1000..=1000).contains(&v) {
                    return Err(Reject::Range(
                        "oom_score_adj out of range (-1000 to 1000)".into(),
                    ));
                }
                msg.oom_score_adj = Some(v as i32);
            }
            "action" => {
                let a = parse_quoted(&mut s, "action")?;
                msg.action = Some(
                    ViolationAction::parse(&a)
                        .ok_or_else(|| Reject::Range(format!("unknown action: {a}")))?,
                );
            }
            other => return Err(Reject::Unknown(format!("unknown field: {other}"))),
        }
        consume_comma(&mut s);
    }

    if !has_pid {
        return Err(Reject::Payload("missing required field: pid".into()));
    }
    Ok(msg)
}

pub fn parse_gov_apply(payload: &str) -> ParseResult {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return ParseResult::rejected(
            AckCode::NackInvalidPayload,
            format!("payload exceeds {MAX_PAYLOAD_SIZE} bytes"),
        );
    }
    if trim(payload).is_empty() {
        return ParseResult::rejected(AckCode::NackInvalidPayload, "empty payload");
    }

    match parse_body(payload) {
        Ok(msg) => ParseResult {
            ok: true,
            ack: AckCode::Ack,
            msg,
            detail: String::new(),
        },
        Err(rej) => {
            let ack = rej.ack();
            ParseResult::rejected(ack, rej.detail())
        }
    }
}

/// Canonical serialization; `parse_gov_apply(serialize_gov_apply(m))` accepts
/// every message in the schema and returns an equal message.
pub fn serialize_gov_apply(msg: &GovApplyMsg) -> String {
    let mut parts: Vec<String> = vec![format!("\"pid\":{}", msg.pid)];
    if let Some(g) = &msg.group {
        parts.push(format!("\"group\":\"{g}\""));
    }
    if let Some(cpu) = &msg.cpu {
        let mut inner = Vec::new();
        if let Some(a) = &cpu.affinity {
            inner.push(format!("\"affinity\":\"{a}\""));
        }
        if let Some(n) = cpu.nice {
            inner.push(format!("\"nice\":{n}"));
        }
        if let Some(p) = cpu.max_pct {
            inner.push(format!("\"max_pct\":{p}"));
        }
        if let Some(q) = cpu.quota_us {
            inner.push(format!("\"quota_us\":{q}"));
        }
        if let Some(p) = cpu.period_us {
            inner.push(format!("\"period_us\":{p}"));
        }
        parts.push(format!("\"cpu\":{{{}}}", inner.join(",")));
    }
    if let Some(mem) = &msg.mem {
        let mut inner = Vec::new();
        if let Some(m) = mem.max_bytes {
            inner.push(format!("\"max_bytes\":{m}"));
        }
        if let Some(h) = mem.high_bytes {
            inner.push(format!("\"high_bytes\":{h}"));
        }
        parts.push(format!("\"mem\":{{{}}}", inner.join(",")));
    }
    if let Some(pids) = &msg.pids {
        let mut inner = Vec::new();
        if let Some(m) = pids.max {
            inner.push(format!("\"max\":{m}"));
        }
        parts.push(format!("\"pids\":{{{}}}", inner.join(",")));
    }
    if let Some(rlim) = &msg.rlim {
        let mut inner = Vec::new();
        if let Some(v) = rlim.nofile_soft {
            inner.push(format!("\"nofile_soft\":{v}"));
        }
        if let Some(v) = rlim.nofile_hard {
            inner.push(format!("\"nofile_hard\":{v}"));
        }
        if let Some(v) = rlim.core_soft {
            inner.push(format!("\"core_soft\":{v}"));
        }
        if let Some(v) = rlim.core_hard {
            inner.push(format!("\"core_hard\":{v}"));
        }
        parts.push(format!("\"rlim\":{{{}}}", inner.join(",")));
    }
    if let Some(v) = msg.oom_score_adj {
        parts.push(format!("\"oom_score_adj\":{v}"));
    }
    if let Some(t) = &msg.timeouts {
        let mut inner = Vec::new();
        if let Some(v) = t.apply_deadline_ms {
            inner.push(format!("\"apply_deadline_ms\":{v}"));
        }
        parts.push(format!("\"timeouts\":{{{}}}", inner.join(",")));
    }
    if let Some(a) = msg.action {
        parts.push(format!("\"action\":\"{}\"", a.as_str()));
    }
    format!("{{{}}}", parts.join(","))
}
