//! Paginated lex-reverse scanning of v2 index sorted sets.
//!
//! Every v2 index set (§4.1) scores all members `0`; ordering is purely
//! lexicographic. The read/delete/iterate paths all page through a set in
//! the same way: `ZREVRANGEBYLEX key + - LIMIT offset count`, repeated
//! until a page comes back shorter than the batch size. `ZSCAN` is not an
//! option here since it does not guarantee any particular order, and the
//! read path depends on lex-reverse order to see the most specific variant
//! first (the identifier's zero-padded `score` prefix, see `identifier.rs`).

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use crate::errors::CacheResult;

/// Page through `key` in lex-reverse order, `batch_size` members at a time,
/// calling `on_page` with each page. `on_page` returns `false` to stop
/// early (used by the read path, which only needs the first matching
/// variant) or `true` to continue to the next page.
pub async fn for_each_lex_page<F>(
    conn: &mut MultiplexedConnection,
    key: &str,
    batch_size: usize,
    mut on_page: F,
) -> CacheResult<()>
where
    F: FnMut(&[String]) -> bool,
{
    let mut offset: isize = 0;
    let batch = batch_size.max(1) as isize;
    loop {
        let page: Vec<String> = conn.zrevrangebylex_limit(key, "+", "-", offset, batch).await?;
        let page_len = page.len() as isize;
        let keep_going = on_page(&page);
        if !keep_going || page_len < batch {
            return Ok(());
        }
        offset += batch;
    }
}

/// Collect every member of `key` in lex-reverse order. Convenience wrapper
/// over `for_each_lex_page` for callers (manager introspection paths) that
/// need the whole set rather than an early-stoppable scan.
pub async fn collect_lex_reverse(
    conn: &mut MultiplexedConnection,
    key: &str,
    batch_size: usize,
) -> CacheResult<Vec<String>> {
    let mut out = Vec::new();
    for_each_lex_page(conn, key, batch_size, |page| {
        out.extend_from_slice(page);
        true
    })
    .await?;
    Ok(out)
}
