use std::collections::HashMap;

use http_types::cookies::Cookie;
use http_types::Request;
use log::debug;

/// A lazily decoded view of a request's `Cookie` header.
///
/// The raw header values are captured when the exchange is created; decoding
/// happens on first access and the result is cached for the lifetime of the
/// exchange.
#[derive(Debug)]
pub(crate) struct Cookies {
    raw: Vec<String>,
    cached: Option<HashMap<String, Vec<Cookie<'static>>>>,
}

impl Cookies {
    pub(crate) fn from_request(req: &Request) -> Self {
        let raw = match req.header("cookie") {
            Some(values) => values.iter().map(|v| v.as_str().to_owned()).collect(),
            None => vec![],
        };
        Cookies { raw, cached: None }
    }

    /// The decoded cookies, keyed by name. Computed once.
    pub(crate) fn cached(&mut self) -> &HashMap<String, Vec<Cookie<'static>>> {
        let raw = &self.raw;
        self.cached.get_or_insert_with(|| decode(raw))
    }
}

fn decode(raw: &[String]) -> HashMap<String, Vec<Cookie<'static>>> {
    let mut cookies: HashMap<String, Vec<Cookie<'static>>> = HashMap::new();
    for header in raw {
        for pair in header.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            match Cookie::parse(pair.to_owned()) {
                Ok(cookie) => cookies
                    .entry(cookie.name().to_owned())
                    .or_insert_with(Vec::new)
                    .push(cookie),
                Err(err) => debug!("skipping malformed cookie pair {:?}: {}", pair, err),
            }
        }
    }
    cookies
}
