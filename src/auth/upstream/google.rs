use super::{ProviderConfig, UpstreamTokenResult, UserInfo};
use anyhow::{Context, anyhow};
use serde::Deserialize;
use url::Url;

pub fn authorization_url(
    config: &ProviderConfig,
    state: &str,
    code_challenge: &str,
    redirect_uri: &str,
    scopes: &[String],
) -> Url {
    let mut url = Url::parse(&config.authorize_url).expect("google authorize_url must be a valid URL");
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", &config.client_id)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("state", state)
        .append_pair("code_challenge", code_challenge)
        .append_pair("code_challenge_method", "S256")
        .append_pair("scope", &scopes.join(" "))
        // offline access + forced consent is what gets Google to hand back
        // a refresh token on every authorization, not just the first.
        .append_pair("access_type", "offline")
        .append_pair("prompt", "consent");
    url
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GoogleUserInfo {
    sub: String,
    email: Option<String>,
    name: Option<String>,
    given_name: Option<String>,
    family_name: Option<String>,
    picture: Option<String>,
}

pub async fn exchange_code(
    http: &reqwest::Client,
    config: &ProviderConfig,
    code: &str,
    verifier: &str,
    redirect_uri: &str,
) -> anyhow::Result<UpstreamTokenResult> {
    let params = [
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("client_id", &config.client_id),
        ("client_secret", &config.client_secret),
        ("code_verifier", verifier),
    ];

    let token_response = http
        .post(&config.token_url)
        .form(&params)
        .send()
        .await
        .context("google token request failed")?
        .error_for_status()
        .context("google token endpoint returned an error status")?
        .json::<TokenResponse>()
        .await
        .context("google token response was not well-formed")?;

    let userinfo = http
        .get(&config.userinfo_url)
        .bearer_auth(&token_response.access_token)
        .send()
        .await
        .context("google userinfo request failed")?
        .error_for_status()
        .context("google userinfo endpoint returned an error status")?
        .json::<GoogleUserInfo>()
        .await
        .context("google userinfo response was not well-formed")?;

    if userinfo.sub.is_empty() {
        return Err(anyhow!("google userinfo response missing sub"));
    }

    Ok(UpstreamTokenResult {
        access_token: token_response.access_token,
        refresh_token: token_response.refresh_token,
        expires_in: token_response.expires_in,
        user_info: UserInfo {
            id: userinfo.sub,
            email: userinfo.email,
            name: userinfo.name,
            given_name: userinfo.given_name,
            family_name: userinfo.family_name,
            picture: userinfo.picture,
        },
    })
}
