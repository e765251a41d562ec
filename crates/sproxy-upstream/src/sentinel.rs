use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::Rng;
use serde_json::{Value as JsonValue, json};
use sha3::{Digest, Sha3_512};
use time::UtcOffset;
use time::macros::format_description;
use tracing::warn;
use uuid::Uuid;

use sproxy_common::{UpstreamError, UpstreamResult};

use crate::client::{CHATGPT_BASE_URL, SoraClient};
use crate::types::SentinelChallenge;

pub(crate) const SENTINEL_FLOW: &str = "sora_2_create_task";

const POW_MAX_ITERATIONS: u32 = 500_000;
const POW_FALLBACK_PREFIX: &str = "wQ8Lk5FbGpA2NcR9dShT6gYjU7VxZ4D";
const SENTINEL_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

const POW_SCRIPTS: [&str; 1] = [
    "https://cdn.oaistatic.com/_next/static/cXh69klOLzS0Gy2joLDRS/_ssgManifest.js?dpl=453ebaec0d44c2decab71692e1bfe39be35a24b3",
];
const POW_DPL: [&str; 1] = ["prod-f501fe933b3edf57aea882da888e1a544df99840"];
const POW_CORES: [i64; 4] = [8, 16, 24, 32];
const POW_SCREENS: [i64; 4] = [1920 + 1080, 2560 + 1440, 1920 + 1200, 2560 + 1600];
const POW_NAVIGATOR_KEYS: [&str; 13] = [
    "registerProtocolHandler\u{2212}function registerProtocolHandler() { [native code] }",
    "storage\u{2212}[object StorageManager]",
    "locks\u{2212}[object LockManager]",
    "appCodeName\u{2212}Mozilla",
    "permissions\u{2212}[object Permissions]",
    "webdriver\u{2212}false",
    "vendor\u{2212}Google Inc.",
    "mediaDevices\u{2212}[object MediaDevices]",
    "cookieEnabled\u{2212}true",
    "product\u{2212}Gecko",
    "productSub\u{2212}20030107",
    "hardwareConcurrency\u{2212}32",
    "onLine\u{2212}true",
];
const POW_DOCUMENT_KEYS: [&str; 2] = ["_reactListeningo743lnnpvdg", "location"];
const POW_WINDOW_KEYS: [&str; 18] = [
    "0",
    "window",
    "self",
    "document",
    "name",
    "location",
    "navigator",
    "screen",
    "innerWidth",
    "innerHeight",
    "localStorage",
    "sessionStorage",
    "crypto",
    "performance",
    "fetch",
    "setTimeout",
    "setInterval",
    "console",
];

/// EST-formatted wall-clock string baked into the fingerprint.
fn pow_parse_time() -> String {
    let est = UtcOffset::from_hms(-5, 0, 0).expect("static offset");
    let now = time::OffsetDateTime::now_utc().to_offset(est);
    let fmt = format_description!(
        "[weekday repr:short] [month repr:short] [day] [year] [hour]:[minute]:[second]"
    );
    let formatted = now.format(&fmt).unwrap_or_default();
    format!("{formatted} GMT-0500 (Eastern Standard Time)")
}

/// Synthetic browser fingerprint; slots 3 and 9 are overwritten by the
/// search counter during the solve.
fn pow_config(user_agent: &str) -> Vec<JsonValue> {
    let mut rng = rand::rng();
    let perf_ms = std::time::SystemTime::UNIX_EPOCH
        .elapsed()
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or_default();
    vec![
        json!(POW_SCREENS[rng.random_range(0..POW_SCREENS.len())]),
        json!(pow_parse_time()),
        json!(4294705152_i64),
        json!(0),
        json!(user_agent),
        json!(POW_SCRIPTS[rng.random_range(0..POW_SCRIPTS.len())]),
        json!(POW_DPL[rng.random_range(0..POW_DPL.len())]),
        json!("en-US"),
        json!("en-US,es-US,en,es"),
        json!(0),
        json!(POW_NAVIGATOR_KEYS[rng.random_range(0..POW_NAVIGATOR_KEYS.len())]),
        json!(POW_DOCUMENT_KEYS[rng.random_range(0..POW_DOCUMENT_KEYS.len())]),
        json!(POW_WINDOW_KEYS[rng.random_range(0..POW_WINDOW_KEYS.len())]),
        json!(perf_ms % 1_000_000.0),
        json!(Uuid::new_v4().to_string()),
        json!(""),
        json!(POW_CORES[rng.random_range(0..POW_CORES.len())]),
        json!(perf_ms - (perf_ms % 1_000_000.0)),
    ]
}

fn parse_difficulty(difficulty: &str) -> Option<Vec<u8>> {
    if difficulty.is_empty() || difficulty.len() % 2 != 0 {
        return None;
    }
    difficulty
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(pair, 16).ok()
        })
        .collect()
}

/// SHA3-512 search over a 32-bit counter written into slots 3 and 9.
///
/// Satisfied when the first `len(difficulty)/2` bytes of
/// `sha3_512(seed || base64(json(config)))` compare `<=` the difficulty
/// bytes. Returns the base64 config on success, a synthetic failure token on
/// exhaustion.
fn solve_pow(
    seed: &str,
    difficulty: &str,
    config: &[JsonValue],
    max_iterations: u32,
) -> (String, bool) {
    let Some(target) = parse_difficulty(difficulty) else {
        return (fallback_token(seed), false);
    };
    let diff_len = target.len();

    // Serialize the static stretches once; only the two counter slots vary.
    let head = serde_json::to_string(&config[..3]).unwrap_or_default();
    let mid = serde_json::to_string(&config[4..9]).unwrap_or_default();
    let tail = serde_json::to_string(&config[10..]).unwrap_or_default();
    let part1 = format!("{},", &head[..head.len() - 1]);
    let part2 = format!(",{},", &mid[1..mid.len() - 1]);
    let part3 = format!(",{}", &tail[1..]);

    let seed_bytes = seed.as_bytes();
    for i in 0..max_iterations {
        let candidate = format!("{part1}{i}{part2}{}{part3}", i >> 1);
        let encoded = BASE64.encode(candidate.as_bytes());

        let mut hasher = Sha3_512::new();
        hasher.update(seed_bytes);
        hasher.update(encoded.as_bytes());
        let hash = hasher.finalize();

        if hash[..diff_len] <= target[..] {
            return (encoded, true);
        }
    }
    (fallback_token(seed), false)
}

fn fallback_token(seed: &str) -> String {
    format!(
        "{POW_FALLBACK_PREFIX}{}",
        BASE64.encode(format!("\"{seed}\"").as_bytes())
    )
}

/// The final header value: `{"p", "t", "c", "id", "flow"}` as compact JSON.
fn header_payload(final_pow: &str, challenge: &SentinelChallenge, req_id: &str) -> String {
    json!({
        "p": final_pow,
        "t": challenge.turnstile.dx.clone().unwrap_or_default(),
        "c": challenge.token.clone().unwrap_or_default(),
        "id": req_id,
        "flow": SENTINEL_FLOW,
    })
    .to_string()
}

async fn solve_off_thread(
    seed: String,
    difficulty: String,
    user_agent: &'static str,
) -> UpstreamResult<(String, bool)> {
    // CPU-bound: keep it off the IO scheduler so concurrent requests retain
    // forward progress.
    tokio::task::spawn_blocking(move || {
        let config = pow_config(user_agent);
        solve_pow(&seed, &difficulty, &config, POW_MAX_ITERATIONS)
    })
    .await
    .map_err(|err| UpstreamError::Transport(format!("pow task failed: {err}")))
}

/// Produces the `openai-sentinel-token` header value for one creation call.
pub(crate) async fn sentinel_header(
    client: &SoraClient,
    token: Option<&str>,
    proxy: Option<&str>,
) -> UpstreamResult<String> {
    let req_id = Uuid::new_v4().to_string();

    let seed = format!("{}", rand::rng().random::<f64>());
    let (solution, _) = solve_off_thread(seed, "0fffff".to_string(), SENTINEL_USER_AGENT).await?;
    let pow_token = format!("gAAAAAC{solution}");

    let url = format!("{CHATGPT_BASE_URL}/backend-api/sentinel/req");
    let payload = json!({"p": pow_token, "flow": SENTINEL_FLOW, "id": req_id});

    let mut builder = client
        .http(proxy)?
        .post(&url)
        .header("Accept", "application/json, text/plain, */*")
        .header("Origin", "https://sora.chatgpt.com")
        .header("Referer", "https://sora.chatgpt.com/")
        .header("User-Agent", SENTINEL_USER_AGENT)
        .timeout(std::time::Duration::from_secs(10))
        .json(&payload);
    if let Some(token) = token {
        builder = builder.header("Authorization", format!("Bearer {token}"));
    }

    let resp = builder
        .send()
        .await
        .map_err(|err| UpstreamError::Transport(err.to_string()))?;
    let status = resp.status().as_u16();
    let body = resp
        .bytes()
        .await
        .map_err(|err| UpstreamError::Transport(err.to_string()))?;
    if !matches!(status, 200 | 201) {
        return Err(UpstreamError::Status {
            status,
            body: format!("sentinel request failed: {}", String::from_utf8_lossy(&body)),
        });
    }
    let challenge: SentinelChallenge = serde_json::from_slice(&body)
        .map_err(|err| UpstreamError::Transport(format!("invalid sentinel response: {err}")))?;

    let mut final_pow = pow_token;
    if challenge.proofofwork.required {
        let seed = challenge.proofofwork.seed.clone().unwrap_or_default();
        let difficulty = challenge.proofofwork.difficulty.clone().unwrap_or_default();
        if !seed.is_empty() && !difficulty.is_empty() {
            let (solution, solved) =
                solve_off_thread(seed, difficulty, SENTINEL_USER_AGENT).await?;
            if !solved {
                warn!(event = "pow_exhausted", "using synthetic failure token");
            }
            final_pow = format!("gAAAAAB{solution}");
        }
    }

    Ok(header_payload(&final_pow, &challenge, &req_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_has_eighteen_slots_with_zeroed_counters() {
        let config = pow_config(SENTINEL_USER_AGENT);
        assert_eq!(config.len(), 18);
        assert_eq!(config[3], json!(0));
        assert_eq!(config[9], json!(0));
        assert_eq!(config[7], json!("en-US"));
    }

    #[test]
    fn parse_time_carries_est_suffix() {
        let formatted = pow_parse_time();
        assert!(formatted.ends_with("GMT-0500 (Eastern Standard Time)"));
    }

    #[test]
    fn trivial_difficulty_solves_and_satisfies_the_bound() {
        let config = pow_config(SENTINEL_USER_AGENT);
        let seed = "0.123456789";
        let difficulty = "ffff";
        let (solution, solved) = solve_pow(seed, difficulty, &config, 10);
        assert!(solved);

        // Recompute the bound the upstream checks.
        let mut hasher = Sha3_512::new();
        hasher.update(seed.as_bytes());
        hasher.update(solution.as_bytes());
        let hash = hasher.finalize();
        let target = parse_difficulty(difficulty).unwrap();
        assert!(hash[..target.len()] <= target[..]);

        // The solution decodes to the config with the counters written in;
        // a trivial difficulty is satisfied on the first iteration.
        let decoded = BASE64.decode(solution.as_bytes()).unwrap();
        let value: Vec<JsonValue> = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(value.len(), 18);
        assert_eq!(value[3], json!(0));
        assert_eq!(value[9], json!(0));
    }

    #[test]
    fn exhaustion_yields_the_synthetic_failure_token() {
        let config = pow_config(SENTINEL_USER_AGENT);
        let (token, solved) = solve_pow("0.5", "0000", &config, 5);
        assert!(!solved);
        assert!(token.starts_with(POW_FALLBACK_PREFIX));
        let encoded = &token[POW_FALLBACK_PREFIX.len()..];
        let decoded = BASE64.decode(encoded.as_bytes()).unwrap();
        assert_eq!(decoded, b"\"0.5\"");
    }

    #[test]
    fn invalid_difficulty_fails_closed() {
        let config = pow_config(SENTINEL_USER_AGENT);
        let (token, solved) = solve_pow("0.5", "xyz", &config, 5);
        assert!(!solved);
        assert!(token.starts_with(POW_FALLBACK_PREFIX));
    }

    #[test]
    fn header_payload_carries_all_fields() {
        let challenge: SentinelChallenge = serde_json::from_str(
            r#"{"proofofwork":{"required":true,"seed":"s","difficulty":"0f"},
                "turnstile":{"dx":"dx-token"},"token":"c-token"}"#,
        )
        .unwrap();
        let payload = header_payload("gAAAAABxyz", &challenge, "req-1");
        let value: JsonValue = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["p"], "gAAAAABxyz");
        assert_eq!(value["t"], "dx-token");
        assert_eq!(value["c"], "c-token");
        assert_eq!(value["id"], "req-1");
        assert_eq!(value["flow"], SENTINEL_FLOW);
    }
}
