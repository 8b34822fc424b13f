/// Appends a cache-busting query parameter, using `&` if the URL already
/// carries a query string and `?` otherwise.
pub fn append_query(url: &str, param: &str) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}{param}")
}
