//! Predicates deciding which requests may carry the session's access token

use std::fmt;

use predicates::{reflection, Predicate};
use reqwest::Request;
use url::{Origin, Url};

/// Only attach an access token if the request is bound for the same origin
/// as the API
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SameOrigin {
    origin: Origin,
}

impl SameOrigin {
    /// Construct a new predicate matching the origin of `url`
    pub fn new(url: &Url) -> Self {
        Self {
            origin: url.origin(),
        }
    }
}

impl Predicate<Request> for SameOrigin {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().origin() == self.origin
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "origin",
                    req.url().origin().ascii_serialization(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for SameOrigin {}
impl fmt::Display for SameOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("origin == ")?;
        f.write_str(&self.origin.ascii_serialization())
    }
}

/// Only attach an access token if the request is being sent over HTTPS
#[derive(Clone, Copy, Debug)]
pub struct HttpsOnly;

impl Predicate<Request> for HttpsOnly {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().scheme() == "https"
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "scheme",
                    req.url().scheme().to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for HttpsOnly {}
impl fmt::Display for HttpsOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheme is https")
    }
}
