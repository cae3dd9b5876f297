use thiserror::Error;
use url::Url;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrlRejection {
    #[error("url could not be parsed")]
    Unparseable,
    #[error("scheme `{0}` is not tracked")]
    UntrackedScheme(String),
    #[error("url has no host")]
    MissingHost,
}

/// Returns the domain a page's time is attributed to.
///
/// Only `http`/`https` pages count; browser-internal and extension pages are
/// rejected before any session can open.
pub fn trackable_domain(raw: &str) -> Result<String, UrlRejection> {
    let url = Url::parse(raw.trim()).map_err(|_| UrlRejection::Unparseable)?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(UrlRejection::UntrackedScheme(other.to_string())),
    }
    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or(UrlRejection::MissingHost)?
        .to_ascii_lowercase();
    Ok(host
        .strip_prefix("www.")
        .map(str::to_string)
        .unwrap_or(host))
}
