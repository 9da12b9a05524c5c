use url::Url;

use harvest_common::Subquery;

/// Build the search URL for `job`'s current window.
///
/// The source's `until:` operator is exclusive, so the bound sent is one
/// second past the job's inclusive `until`.
pub fn search_url(base: &str, job: &Subquery) -> Result<String, url::ParseError> {
    let mut url = Url::parse(base)?;
    let q = format!(
        "{} since:{} until:{}",
        job.search_terms,
        job.since.timestamp(),
        job.until.timestamp().saturating_add(1)
    );

    {
        let mut pairs = url.query_pairs_mut();
        if let Some(lang) = job.language.as_deref().filter(|l| !l.is_empty()) {
            pairs.append_pair("l", lang);
        }
        pairs
            .append_pair("f", "tweets")
            .append_pair("src", "typd")
            .append_pair("vertical", "default")
            .append_pair("q", &q);
    }

    Ok(url.into())
}
