// Credentials: a cached OAuth token on disk, refreshed when it expires and
// obtained through the browser when there is nothing usable to refresh.
// The migration loop only ever sees the resulting access token.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use oauth2::basic::{BasicClient, BasicTokenResponse};
use oauth2::reqwest::http_client;
use oauth2::url::Url;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::path::PathBuf;

/// Scopes requested for the Drive API. Changing them requires deleting the
/// cached token so a new consent is collected.
pub const SCOPES: [&str; 2] = [
    "https://www.googleapis.com/auth/drive.metadata.readonly",
    "https://www.googleapis.com/auth/drive",
];

const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

// Refresh a little before the server would reject the token.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Token record persisted between runs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoredToken {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl StoredToken {
    /// Whether the access token can still be used at `now`. Tokens without
    /// a recorded expiry are trusted.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        if self.token.is_empty() {
            return false;
        }
        match self.expiry {
            Some(expiry) => expiry - now > Duration::seconds(EXPIRY_MARGIN_SECS),
            None => true,
        }
    }
}

/// Application credentials from the client secret file downloaded from the
/// cloud console.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_auth_uri() -> String {
    DEFAULT_AUTH_URI.to_string()
}

#[derive(Deserialize)]
struct ClientSecretsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

impl ClientSecrets {
    pub fn from_json(json: &str) -> Result<Self> {
        let file: ClientSecretsFile =
            serde_json::from_str(json).context("Parsing client secret json")?;
        file.installed
            .or(file.web)
            .ok_or_else(|| anyhow!("client secret file has no \"installed\" or \"web\" section"))
    }
}

/// Everything needed to turn "maybe a token on disk" into a usable token.
pub trait CredentialProvider {
    /// The previously persisted token, if any.
    fn load_cached(&self) -> Result<Option<StoredToken>>;

    fn is_valid(&self, token: &StoredToken) -> bool {
        token.is_fresh(Utc::now())
    }

    /// Exchange the refresh token for a new access token.
    fn refresh(&self, token: &StoredToken) -> Result<StoredToken>;

    /// Obtain a token with the user's involvement.
    fn interactive_obtain(&self) -> Result<StoredToken>;

    fn persist(&self, token: &StoredToken) -> Result<()>;
}

/// Produce a valid token: reuse the cached one, refresh it, or ask the user.
/// Newly obtained tokens are persisted.
pub fn authorize<P: CredentialProvider + ?Sized>(provider: &P) -> Result<StoredToken> {
    let cached = provider.load_cached()?;
    if let Some(token) = &cached {
        if provider.is_valid(token) {
            log::debug!("Using cached credentials");
            return Ok(token.clone());
        }
    }

    let token = match cached {
        Some(token) if token.refresh_token.is_some() => {
            log::info!("Refreshing expired credentials");
            match provider.refresh(&token) {
                Ok(refreshed) => refreshed,
                Err(e) => {
                    log::warn!("Credential refresh failed ({:#}), authorizing again", e);
                    provider.interactive_obtain()?
                }
            }
        }
        _ => provider.interactive_obtain()?,
    };

    provider.persist(&token)?;
    Ok(token)
}

/// Browser-based OAuth flow backed by a token file and a client secret file.
pub struct OAuthProvider {
    token_file: PathBuf,
    client_secret_file: PathBuf,
    scopes: Vec<String>,
}

impl OAuthProvider {
    pub fn new(token_file: PathBuf, client_secret_file: PathBuf) -> Self {
        OAuthProvider {
            token_file,
            client_secret_file,
            scopes: SCOPES.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn load_secrets(&self) -> Result<ClientSecrets> {
        let json = fs::read_to_string(&self.client_secret_file).with_context(|| {
            format!(
                "Failed to read client secret file {}",
                self.client_secret_file.display()
            )
        })?;
        ClientSecrets::from_json(&json)
    }

    fn oauth_client(secrets: &ClientSecrets) -> Result<BasicClient> {
        Ok(BasicClient::new(
            ClientId::new(secrets.client_id.clone()),
            Some(ClientSecret::new(secrets.client_secret.clone())),
            AuthUrl::new(secrets.auth_uri.clone()).context("invalid authorization url")?,
            Some(TokenUrl::new(secrets.token_uri.clone()).context("invalid token url")?),
        ))
    }

    fn to_stored(
        &self,
        secrets: &ClientSecrets,
        response: &BasicTokenResponse,
        previous_refresh: Option<String>,
    ) -> StoredToken {
        let expiry = response
            .expires_in()
            .and_then(|d| Duration::from_std(d).ok())
            .map(|d| Utc::now() + d);
        let scopes = response
            .scopes()
            .map(|s| s.iter().map(|scope| scope.to_string()).collect())
            .unwrap_or_else(|| self.scopes.clone());
        StoredToken {
            token: response.access_token().secret().to_string(),
            refresh_token: response
                .refresh_token()
                .map(|t| t.secret().to_string())
                .or(previous_refresh),
            token_uri: secrets.token_uri.clone(),
            client_id: secrets.client_id.clone(),
            client_secret: secrets.client_secret.clone(),
            scopes,
            expiry,
        }
    }
}

impl CredentialProvider for OAuthProvider {
    fn load_cached(&self) -> Result<Option<StoredToken>> {
        if !self.token_file.exists() {
            log::debug!("No cached token at {}", self.token_file.display());
            return Ok(None);
        }
        let json = fs::read_to_string(&self.token_file).with_context(|| {
            format!("Failed to read token file {}", self.token_file.display())
        })?;
        match serde_json::from_str(&json) {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                log::warn!(
                    "Ignoring unreadable token file {}: {}",
                    self.token_file.display(),
                    e
                );
                Ok(None)
            }
        }
    }

    fn refresh(&self, token: &StoredToken) -> Result<StoredToken> {
        let refresh = token
            .refresh_token
            .clone()
            .ok_or_else(|| anyhow!("cached token has no refresh token"))?;
        let secrets = ClientSecrets {
            client_id: token.client_id.clone(),
            client_secret: token.client_secret.clone(),
            auth_uri: default_auth_uri(),
            token_uri: token.token_uri.clone(),
        };
        let response = Self::oauth_client(&secrets)?
            .exchange_refresh_token(&RefreshToken::new(refresh.clone()))
            .request(http_client)
            .map_err(|e| anyhow!("token refresh failed: {:?}", e))?;
        Ok(self.to_stored(&secrets, &response, Some(refresh)))
    }

    fn interactive_obtain(&self) -> Result<StoredToken> {
        let secrets = self.load_secrets()?;
        if !crate::ui::confirm_authorization()? {
            bail!("authorization declined");
        }

        let listener =
            TcpListener::bind("127.0.0.1:0").context("Failed to start redirect listener")?;
        let port = listener.local_addr()?.port();
        let redirect = format!("http://127.0.0.1:{}/", port);
        let client = Self::oauth_client(&secrets)?
            .set_redirect_uri(RedirectUrl::new(redirect).context("invalid redirect url")?);

        let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
        let mut request = client
            .authorize_url(CsrfToken::new_random)
            .add_extra_param("access_type", "offline")
            .set_pkce_challenge(challenge);
        for scope in &self.scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }
        let (auth_url, state) = request.url();

        println!(
            "Please visit this URL to authorize this application: {}",
            auth_url
        );
        open_browser(auth_url.as_str());
        let code = wait_for_code(&listener, state.secret())?;

        let response = client
            .exchange_code(AuthorizationCode::new(code))
            .set_pkce_verifier(verifier)
            .request(http_client)
            .map_err(|e| anyhow!("authorization code exchange failed: {:?}", e))?;
        log::info!("Authorization complete");
        Ok(self.to_stored(&secrets, &response, None))
    }

    fn persist(&self, token: &StoredToken) -> Result<()> {
        if let Some(dir) = self.token_file.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let json = serde_json::to_string(token).context("Serializing token")?;
        fs::write(&self.token_file, json).with_context(|| {
            format!("Failed to write token file {}", self.token_file.display())
        })?;
        log::debug!("Saved credentials to {}", self.token_file.display());
        Ok(())
    }
}

/// Accept redirect requests on `listener` until one carries the
/// authorization result.
fn wait_for_code(listener: &TcpListener, expected_state: &str) -> Result<String> {
    loop {
        let (stream, _) = listener.accept().context("Redirect listener failed")?;
        let mut reader = BufReader::new(stream);
        let mut request_line = String::new();
        reader.read_line(&mut request_line)?;
        // Drain the headers so closing the socket does not reset the browser.
        let mut header = String::new();
        while reader.read_line(&mut header)? > 0 && !header.trim().is_empty() {
            header.clear();
        }
        let stream = reader.get_mut();

        let target = request_line.split_whitespace().nth(1).unwrap_or("/");
        match parse_redirect(target, expected_state) {
            Ok(Some(code)) => {
                stream.write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\n\
                      The authentication flow has completed. You may close this window.\n",
                )?;
                return Ok(code);
            }
            Ok(None) => {
                stream.write_all(b"HTTP/1.1 404 Not Found\r\nConnection: close\r\n\r\n")?;
            }
            Err(e) => {
                let page = format!(
                    "HTTP/1.1 400 Bad Request\r\nContent-Type: text/plain\r\n\
                     Connection: close\r\n\r\nAuthorization failed: {:#}\n",
                    e
                );
                if let Err(write_err) = stream.write_all(page.as_bytes()) {
                    log::debug!("Could not answer redirect request: {}", write_err);
                }
                return Err(e);
            }
        }
    }
}

/// Best-effort attempt to show `url` in the desktop browser. The URL has
/// already been printed, so failures are only logged.
fn open_browser(url: &str) {
    #[cfg(target_os = "macos")]
    let launched = std::process::Command::new("open").arg(url).spawn();

    #[cfg(target_os = "linux")]
    let launched = std::process::Command::new("xdg-open").arg(url).spawn();

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    let launched: std::io::Result<std::process::Child> = Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "no browser launcher for this platform",
    ));

    if let Err(e) = launched {
        log::debug!("Could not open a browser: {}", e);
    }
}

/// Extract the authorization code from a redirect request target.
/// Returns `Ok(None)` for unrelated requests (e.g. a favicon fetch).
pub fn parse_redirect(target: &str, expected_state: &str) -> Result<Option<String>> {
    let url = Url::parse(&format!("http://localhost{}", target))
        .with_context(|| format!("malformed redirect target {:?}", target))?;
    let param = |key: &str| {
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    };

    if let Some(error) = param("error") {
        bail!("authorization denied: {}", error);
    }
    let Some(code) = param("code") else {
        return Ok(None);
    };
    if param("state").as_deref() != Some(expected_state) {
        bail!("authorization state mismatch");
    }
    Ok(Some(code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use tempfile::TempDir;

    fn token(expiry: Option<DateTime<Utc>>, refresh: Option<&str>) -> StoredToken {
        StoredToken {
            token: "access".into(),
            refresh_token: refresh.map(str::to_string),
            token_uri: DEFAULT_TOKEN_URI.into(),
            client_id: "id".into(),
            client_secret: "secret".into(),
            scopes: SCOPES.iter().map(|s| s.to_string()).collect(),
            expiry,
        }
    }

    #[derive(Default)]
    struct FakeProvider {
        cached: Option<StoredToken>,
        refresh_fails: bool,
        refreshed: Cell<u32>,
        interactive: Cell<u32>,
        persisted: RefCell<Vec<StoredToken>>,
    }

    impl CredentialProvider for FakeProvider {
        fn load_cached(&self) -> Result<Option<StoredToken>> {
            Ok(self.cached.clone())
        }
        fn refresh(&self, token: &StoredToken) -> Result<StoredToken> {
            self.refreshed.set(self.refreshed.get() + 1);
            if self.refresh_fails {
                bail!("invalid_grant");
            }
            Ok(StoredToken {
                token: "refreshed".into(),
                expiry: Some(Utc::now() + Duration::hours(1)),
                ..token.clone()
            })
        }
        fn interactive_obtain(&self) -> Result<StoredToken> {
            self.interactive.set(self.interactive.get() + 1);
            Ok(StoredToken {
                token: "fresh".into(),
                ..token(Some(Utc::now() + Duration::hours(1)), Some("r2"))
            })
        }
        fn persist(&self, token: &StoredToken) -> Result<()> {
            self.persisted.borrow_mut().push(token.clone());
            Ok(())
        }
    }

    #[test]
    fn test_freshness_respects_margin() {
        let now = Utc::now();
        assert!(token(Some(now + Duration::hours(1)), None).is_fresh(now));
        assert!(!token(Some(now + Duration::seconds(30)), None).is_fresh(now));
        assert!(!token(Some(now - Duration::hours(1)), None).is_fresh(now));
        assert!(token(None, None).is_fresh(now));

        let empty = StoredToken {
            token: String::new(),
            ..token(None, None)
        };
        assert!(!empty.is_fresh(now));
    }

    #[test]
    fn test_authorize_uses_valid_cache_without_persisting() {
        let provider = FakeProvider {
            cached: Some(token(Some(Utc::now() + Duration::hours(1)), Some("r"))),
            ..Default::default()
        };
        let got = authorize(&provider).unwrap();
        assert_eq!(got.token, "access");
        assert_eq!(provider.refreshed.get(), 0);
        assert_eq!(provider.interactive.get(), 0);
        assert!(provider.persisted.borrow().is_empty());
    }

    #[test]
    fn test_authorize_refreshes_expired_token() {
        let provider = FakeProvider {
            cached: Some(token(Some(Utc::now() - Duration::hours(1)), Some("r"))),
            ..Default::default()
        };
        let got = authorize(&provider).unwrap();
        assert_eq!(got.token, "refreshed");
        assert_eq!(provider.refreshed.get(), 1);
        assert_eq!(provider.interactive.get(), 0);
        assert_eq!(provider.persisted.borrow().as_slice(), &[got]);
    }

    #[test]
    fn test_authorize_falls_back_when_refresh_fails() {
        let provider = FakeProvider {
            cached: Some(token(Some(Utc::now() - Duration::hours(1)), Some("r"))),
            refresh_fails: true,
            ..Default::default()
        };
        let got = authorize(&provider).unwrap();
        assert_eq!(got.token, "fresh");
        assert_eq!(provider.refreshed.get(), 1);
        assert_eq!(provider.interactive.get(), 1);
        assert_eq!(provider.persisted.borrow().len(), 1);
    }

    #[test]
    fn test_authorize_without_refresh_token_goes_interactive() {
        let provider = FakeProvider {
            cached: Some(token(Some(Utc::now() - Duration::hours(1)), None)),
            ..Default::default()
        };
        authorize(&provider).unwrap();
        assert_eq!(provider.refreshed.get(), 0);
        assert_eq!(provider.interactive.get(), 1);
    }

    #[test]
    fn test_authorize_without_cache_goes_interactive() {
        let provider = FakeProvider::default();
        let got = authorize(&provider).unwrap();
        assert_eq!(got.token, "fresh");
        assert_eq!(provider.interactive.get(), 1);
        assert_eq!(provider.persisted.borrow().len(), 1);
    }

    #[test]
    fn test_token_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let provider = OAuthProvider::new(
            dir.path().join("state").join("token.json"),
            dir.path().join("credentials.json"),
        );
        assert!(provider.load_cached().unwrap().is_none());

        let stored = token(Some(Utc::now() + Duration::hours(1)), Some("r"));
        provider.persist(&stored).unwrap();
        assert_eq!(provider.load_cached().unwrap(), Some(stored));
    }

    #[test]
    fn test_unreadable_token_file_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("token.json");
        fs::write(&path, "not json").unwrap();
        let provider = OAuthProvider::new(path, dir.path().join("credentials.json"));
        assert!(provider.load_cached().unwrap().is_none());
    }

    #[test]
    fn test_reads_token_written_by_google_auth() {
        let json = r#"{
            "token": "ya29.abc",
            "refresh_token": "1//xyz",
            "token_uri": "https://oauth2.googleapis.com/token",
            "client_id": "123.apps.googleusercontent.com",
            "client_secret": "shh",
            "scopes": ["https://www.googleapis.com/auth/drive"],
            "expiry": "2023-03-01T10:20:30.123456Z"
        }"#;
        let token: StoredToken = serde_json::from_str(json).unwrap();
        assert_eq!(token.refresh_token.as_deref(), Some("1//xyz"));
        assert!(!token.is_fresh(Utc::now()));
    }

    #[test]
    fn test_client_secrets_sections() {
        let installed = r#"{"installed": {"client_id": "a", "client_secret": "b",
            "auth_uri": "https://example.test/auth", "token_uri": "https://example.test/token",
            "redirect_uris": ["http://localhost"]}}"#;
        let secrets = ClientSecrets::from_json(installed).unwrap();
        assert_eq!(secrets.client_id, "a");
        assert_eq!(secrets.auth_uri, "https://example.test/auth");

        let web = r#"{"web": {"client_id": "c", "client_secret": "d"}}"#;
        let secrets = ClientSecrets::from_json(web).unwrap();
        assert_eq!(secrets.client_id, "c");
        assert_eq!(secrets.token_uri, DEFAULT_TOKEN_URI);

        assert!(ClientSecrets::from_json(r#"{"other": {}}"#).is_err());
    }

    /// Play the browser: send each request target in turn on its own
    /// connection and collect the replies.
    fn browser(
        addr: std::net::SocketAddr,
        targets: &[&str],
    ) -> std::thread::JoinHandle<Vec<String>> {
        let targets: Vec<String> = targets.iter().map(|t| t.to_string()).collect();
        std::thread::spawn(move || {
            targets
                .iter()
                .map(|target| {
                    let mut stream = std::net::TcpStream::connect(addr).unwrap();
                    let request =
                        format!("GET {} HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n", target);
                    stream.write_all(request.as_bytes()).unwrap();
                    let mut reply = String::new();
                    std::io::Read::read_to_string(&mut stream, &mut reply).unwrap();
                    reply
                })
                .collect()
        })
    }

    #[test]
    fn test_wait_for_code_skips_unrelated_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let tab = browser(
            listener.local_addr().unwrap(),
            &["/favicon.ico", "/?state=s1&code=abc"],
        );

        assert_eq!(wait_for_code(&listener, "s1").unwrap(), "abc");
        let replies = tab.join().unwrap();
        assert!(replies[0].starts_with("HTTP/1.1 404"));
        assert!(replies[1].starts_with("HTTP/1.1 200"));
    }

    #[test]
    fn test_wait_for_code_answers_before_failing() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let tab = browser(listener.local_addr().unwrap(), &["/?state=forged&code=abc"]);

        let err = wait_for_code(&listener, "s1").unwrap_err();
        assert!(err.to_string().contains("state mismatch"));
        let replies = tab.join().unwrap();
        assert!(replies[0].starts_with("HTTP/1.1 400"));
        assert!(replies[0].contains("Authorization failed"));
    }

    #[test]
    fn test_parse_redirect() {
        assert_eq!(
            parse_redirect("/?state=s1&code=4%2F0abc&scope=x", "s1").unwrap(),
            Some("4/0abc".to_string())
        );
        assert_eq!(parse_redirect("/favicon.ico", "s1").unwrap(), None);
        assert!(parse_redirect("/?state=other&code=c", "s1").is_err());
        assert!(parse_redirect("/?error=access_denied&state=s1", "s1").is_err());
    }
}
