//! Websocket address derivation.
//!
//! The engine serves its socket next to the page that hosts the notebook:
//! the base URL (possibly relative) is resolved against the page, reduced to
//! its directory, and moved from `http(s)` to `ws(s)`. A `secret` query
//! parameter on the page (or base) URL is forwarded so authenticated
//! sessions keep working.

use url::Url;

use crate::error::AddressError;

const SECRET_PARAM: &str = "secret";

/// Derive the socket address from a base URL.
///
/// `page_url` is the URL of the hosting page; it is required only when
/// `base_url` is relative.
///
/// # Errors
///
/// Returns [`AddressError::InvalidUrl`] if either URL fails to parse and
/// [`AddressError::UnsupportedScheme`] for schemes other than http/https.
pub fn socket_address(base_url: &str, page_url: Option<&str>) -> Result<Url, AddressError> {
    let page = page_url.map(Url::parse).transpose()?;
    let base = Url::options().base_url(page.as_ref()).parse(base_url)?;

    let mut address = base.join("./")?;
    let scheme = match address.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => return Err(AddressError::UnsupportedScheme(other.to_owned())),
    };
    if address.set_scheme(scheme).is_err() {
        return Err(AddressError::UnsupportedScheme(address.scheme().to_owned()));
    }

    let secret = page
        .as_ref()
        .and_then(|p| find_secret(p))
        .or_else(|| find_secret(&base));
    address.set_query(None);
    address.set_fragment(None);
    if let Some(secret) = secret {
        address.query_pairs_mut().append_pair(SECRET_PARAM, &secret);
    }

    Ok(address)
}

fn find_secret(url: &Url) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == SECRET_PARAM)
        .map(|(_, value)| value.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_base_becomes_ws_directory() {
        let address = socket_address("http://localhost:1234/edit?id=abc", None).expect("address");
        assert_eq!(address.as_str(), "ws://localhost:1234/");
    }

    #[test]
    fn https_keeps_tls() {
        let address = socket_address("https://example.org/notebooks/", None).expect("address");
        assert_eq!(address.as_str(), "wss://example.org/notebooks/");
    }

    #[test]
    fn relative_base_resolves_against_page() {
        let address = socket_address("./", Some("http://127.0.0.1:1234/edit?id=nb")).expect("address");
        assert_eq!(address.as_str(), "ws://127.0.0.1:1234/");
    }

    #[test]
    fn secret_is_forwarded_from_page() {
        let address = socket_address("./", Some("http://localhost:1234/edit?id=nb&secret=s3cr3t"))
            .expect("address");
        assert_eq!(address.as_str(), "ws://localhost:1234/?secret=s3cr3t");
    }

    #[test]
    fn secret_is_forwarded_from_absolute_base() {
        let address = socket_address("http://localhost:1234/?secret=abc", None).expect("address");
        assert_eq!(address.query(), Some("secret=abc"));
    }

    #[test]
    fn relative_base_without_page_is_rejected() {
        let err = socket_address("./", None).expect_err("should fail");
        assert!(matches!(err, AddressError::InvalidUrl(_)));
    }

    #[test]
    fn non_http_scheme_is_rejected() {
        let err = socket_address("ftp://example.org/", None).expect_err("should fail");
        assert_eq!(err, AddressError::UnsupportedScheme("ftp".to_owned()));
    }
}
