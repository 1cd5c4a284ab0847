//! Resolution of the relative references found in manifests.
use url::Url;

use crate::NagareResult;

/// Resolve `reference` against `base`.
///
/// A relative reference without a query inherits the query of `base`, tokens in the
/// manifest url therefore reach every fragment url. Absolute references are taken as is.
pub(crate) fn resolve_url(base: &Url, reference: &str) -> NagareResult<Url> {
    let mut resolved = base.join(reference)?;
    if !has_scheme(reference) && resolved.query().is_none() {
        resolved.set_query(base.query());
    }
    Ok(resolved)
}

fn has_scheme(reference: &str) -> bool {
    match reference.split_once(':') {
        Some((scheme, _)) => {
            scheme.starts_with(|c: char| c.is_ascii_alphabetic())
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        None => false,
    }
}
