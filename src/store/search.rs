//! The search index: case-folded words from the display name parts plus the
//! track's tags, AND-matched. `tag:` terms hit the tags directly.

use std::collections::BTreeSet;

use color_eyre::Result;
use rusqlite::params;

use super::Store;

/// Rebuild the word rows for one track. Called whenever the track appears or
/// its prefs change, since both feed the display names.
pub fn reindex(store: &mut Store, track: &str) -> Result<()> {
    let mut words = BTreeSet::new();
    for part in ["artist", "album", "title"] {
        words.extend(fold(&store.part(track, "display", part)?));
    }
    for tag in store.track_tags(track)? {
        words.extend(fold(&tag));
    }
    words.retain(|w| !store.stopwords().contains(w));

    let db = store.db();
    db.execute("DELETE FROM words WHERE track = ?1", [track])?;
    for word in words {
        db.execute(
            "INSERT OR IGNORE INTO words (word, track) VALUES (?1, ?2)",
            params![word, track],
        )?;
    }
    Ok(())
}

/// Every track matching all of `terms`. A term of the form `tag:NAME`
/// matches tracks carrying that tag; anything else is a word match.
pub fn search(store: &Store, terms: &[String]) -> Result<Vec<String>> {
    let mut matched: Option<BTreeSet<String>> = None;
    for term in terms {
        let hits = if let Some(tag) = term.strip_prefix("tag:") {
            tracks_with_tag(store, tag)?
        } else {
            let folded = term.to_lowercase();
            let mut stmt = store
                .db()
                .prepare("SELECT track FROM words WHERE word = ?1")?;
            let rows = stmt.query_map([&folded], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<BTreeSet<_>, _>>()?
        };
        matched = Some(match matched {
            None => hits,
            Some(prev) => prev.intersection(&hits).cloned().collect(),
        });
        if matched.as_ref().is_some_and(BTreeSet::is_empty) {
            break;
        }
    }
    Ok(matched.unwrap_or_default().into_iter().collect())
}

fn tracks_with_tag(store: &Store, tag: &str) -> Result<BTreeSet<String>> {
    let mut stmt = store
        .db()
        .prepare("SELECT track, value FROM prefs WHERE name = 'tags'")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut out = BTreeSet::new();
    for row in rows {
        let (track, tags) = row?;
        if tags.split(',').any(|t| t.trim() == tag) {
            out.insert(track);
        }
    }
    Ok(out)
}

fn fold(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::store::Store;
    use pretty_assertions::assert_eq;

    fn store() -> Store {
        let config = Config {
            collections: vec!["/m".into()],
            ..Config::default()
        };
        let mut s = Store::open_in_memory(&config).unwrap();
        s.notice("/m/Pink Floyd/Meddle/05 Seamus.ogg", 1).unwrap();
        s.notice("/m/Pink Floyd/Animals/01 Pigs on the Wing.ogg", 1)
            .unwrap();
        s.notice("/m/Orbital/Orbital 2/03 Lush 3-1.ogg", 1).unwrap();
        s
    }

    #[test]
    fn word_search_is_an_and_match() {
        let s = store();
        assert_eq!(
            s.search(&["pink".into()]).unwrap().len(),
            2,
            "both Pink Floyd tracks"
        );
        assert_eq!(
            s.search(&["pink".into(), "seamus".into()]).unwrap(),
            ["/m/Pink Floyd/Meddle/05 Seamus.ogg"]
        );
        assert_eq!(s.search(&["pink".into(), "lush".into()]).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn stopwords_and_case_are_ignored() {
        let s = store();
        // "on" and "the" are stopwords and never indexed
        assert_eq!(s.search(&["on".into()]).unwrap(), Vec::<String>::new());
        assert_eq!(
            s.search(&["PIGS".into()]).unwrap(),
            ["/m/Pink Floyd/Animals/01 Pigs on the Wing.ogg"]
        );
    }

    #[test]
    fn tag_terms() {
        let mut s = store();
        s.set_pref("/m/Orbital/Orbital 2/03 Lush 3-1.ogg", "tags", "electronic, 90s")
            .unwrap();
        assert_eq!(
            s.search(&["tag:electronic".into()]).unwrap(),
            ["/m/Orbital/Orbital 2/03 Lush 3-1.ogg"]
        );
        // tag words are searchable too
        assert_eq!(
            s.search(&["electronic".into()]).unwrap(),
            ["/m/Orbital/Orbital 2/03 Lush 3-1.ogg"]
        );
        assert_eq!(s.search(&["tag:rock".into()]).unwrap(), Vec::<String>::new());
    }
}
