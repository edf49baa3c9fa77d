//! Pages and images compiled into the binary.

use log::*;
use rust_embed::RustEmbed;

use crate::error::StoreError;
use crate::http::Response;
use crate::store::{keys, DurableStore};

#[derive(RustEmbed)]
#[folder = "assets/"]
struct Assets;

/// Largest logo accepted into the durable store.
pub const LOGO_LIMIT: usize = 16 * 1024;

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

/// Serves `name` with every `{{KEY}}` replaced.
pub fn page(name: &str, vars: &[(&str, &str)]) -> Response {
    let Some(file) = Assets::get(name) else {
        error!("assets: {} missing from image", name);
        return Response::error(500, "page missing");
    };
    let mut html = String::from_utf8_lossy(&file.data).into_owned();
    for (key, value) in vars {
        html = html.replace(&format!("{{{{{}}}}}", key), value);
    }
    Response::html(html)
}

/// The uploaded logo if there is one, the built-in one otherwise.
pub fn logo(store: &DurableStore) -> Response {
    if let Some(png) = store.lookup(keys::LOGO).filter(|b| !b.is_empty()) {
        return Response::new(200, "image/png", png);
    }
    match Assets::get("logo.png") {
        Some(file) => Response::new(200, "image/png", file.data),
        None => Response::not_found(),
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum LogoRejected {
    TooLarge,
    NotPng,
}

pub fn validate_logo(png: &[u8]) -> Result<(), LogoRejected> {
    if png.len() > LOGO_LIMIT {
        return Err(LogoRejected::TooLarge);
    }
    if !png.starts_with(PNG_SIGNATURE) {
        return Err(LogoRejected::NotPng);
    }
    Ok(())
}

pub fn store_logo(store: &DurableStore, png: Vec<u8>) -> Result<(), StoreError> {
    let len = png.len();
    store.set(keys::LOGO, png)?;
    info!("assets: stored {} byte logo", len);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::sim::MemoryBackend;

    #[test]
    fn page_substitutes_placeholders() {
        let response = page("portal.html", &[("VERSION", "9.9.9"), ("AP_IP", "10.0.0.1")]);
        let html = String::from_utf8(response.body.into_owned()).unwrap();
        assert!(html.contains("Firmware 9.9.9"));
        assert!(html.contains("http://10.0.0.1/"));
        assert!(!html.contains("{{"));
    }

    #[test]
    fn built_in_logo_until_one_is_stored() {
        let store = DurableStore::new(Arc::new(MemoryBackend::new()));
        let built_in = logo(&store);
        assert!(built_in.body.starts_with(PNG_SIGNATURE));

        let mut custom = PNG_SIGNATURE.to_vec();
        custom.extend_from_slice(b"custom");
        store_logo(&store, custom.clone()).unwrap();
        assert_eq!(logo(&store).body.as_ref(), custom.as_slice());
    }

    #[test]
    fn logo_validation() {
        assert_eq!(validate_logo(b"GIF89a"), Err(LogoRejected::NotPng));
        assert_eq!(validate_logo(&vec![0; LOGO_LIMIT + 1]), Err(LogoRejected::TooLarge));
        assert_eq!(validate_logo(PNG_SIGNATURE), Ok(()));
    }
}
