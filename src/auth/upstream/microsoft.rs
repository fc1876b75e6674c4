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
    let mut url = Url::parse(&config.authorize_url).expect("microsoft authorize_url must be a valid URL");
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", &config.client_id)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("state", state)
        .append_pair("code_challenge", code_challenge)
        .append_pair("code_challenge_method", "S256")
        .append_pair("scope", &scopes.join(" "))
        // offline_access is the Microsoft identity platform's scope for a
        // refresh token, rather than a dedicated query parameter.
        .append_pair("response_mode", "query");
    url
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GraphUserInfo {
    id: String,
    mail: Option<String>,
    #[serde(rename = "userPrincipalName")]
    user_principal_name: Option<String>,
    #[serde(rename = "displayName")]
    display_name: Option<String>,
    #[serde(rename = "givenName")]
    given_name: Option<String>,
    surname: Option<String>,
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
        ("scope", &config.scopes.join(" ")),
    ];

    let token_response = http
        .post(&config.token_url)
        .form(&params)
        .send()
        .await
        .context("microsoft token request failed")?
        .error_for_status()
        .context("microsoft token endpoint returned an error status")?
        .json::<TokenResponse>()
        .await
        .context("microsoft token response was not well-formed")?;

    let userinfo = http
        .get(&config.userinfo_url)
        .bearer_auth(&token_response.access_token)
        .send()
        .await
        .context("microsoft graph /me request failed")?
        .error_for_status()
        .context("microsoft graph /me returned an error status")?
        .json::<GraphUserInfo>()
        .await
        .context("microsoft graph /me response was not well-formed")?;

    if userinfo.id.is_empty() {
        return Err(anyhow!("microsoft graph /me response missing id"));
    }

    // Personal Microsoft accounts often leave `mail` null and carry the
    // address in `userPrincipalName` instead.
    let email = userinfo.mail.or(userinfo.user_principal_name);

    Ok(UpstreamTokenResult {
        access_token: token_response.access_token,
        refresh_token: token_response.refresh_token,
        expires_in: token_response.expires_in,
        user_info: UserInfo {
            id: userinfo.id,
            email,
            name: userinfo.display_name,
            given_name: userinfo.given_name,
            family_name: userinfo.surname,
            picture: None,
        },
    })
}
