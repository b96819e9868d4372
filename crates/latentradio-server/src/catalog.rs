//! The relational store: `tracks`,
//! `playlists`, `playlist_items`, `ratings`, `play_stats`. The core only
//! reads from it once, at startup, to build the Feature Index, and writes
//! to it on explicit user rate/complete actions — everything else (catalog
//! browsing, playlist editing) is an external collaborator this module
//! calls out of scope.
//!
//! A thin `rusqlite::Connection` wrapper that creates its schema with
//! `CREATE TABLE IF NOT EXISTS` on open, no migration framework.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use latentradio_proto::track::{FeatureVector, Track};

pub struct Catalog {
    conn: Connection,
}

impl Catalog {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        let catalog = Self { conn };
        catalog.init_schema()?;
        Ok(catalog)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let catalog = Self { conn };
        catalog.init_schema()?;
        Ok(catalog)
    }

    fn init_schema(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tracks (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                artist TEXT NOT NULL,
                album TEXT NOT NULL,
                year INTEGER,
                cover_url TEXT,
                duration_secs REAL NOT NULL,
                path TEXT NOT NULL,
                features_json TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS playlists (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS playlist_items (
                playlist_id TEXT NOT NULL,
                track_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                FOREIGN KEY(playlist_id) REFERENCES playlists(id),
                FOREIGN KEY(track_id) REFERENCES tracks(id)
            );
            CREATE TABLE IF NOT EXISTS ratings (
                track_id TEXT PRIMARY KEY,
                score INTEGER NOT NULL,
                rated_at INTEGER NOT NULL,
                FOREIGN KEY(track_id) REFERENCES tracks(id)
            );
            CREATE TABLE IF NOT EXISTS play_stats (
                track_id TEXT PRIMARY KEY,
                play_count INTEGER NOT NULL DEFAULT 0,
                complete_count INTEGER NOT NULL DEFAULT 0,
                last_played_at INTEGER,
                FOREIGN KEY(track_id) REFERENCES tracks(id)
            );",
        )
    }

    /// Loads the full catalog into memory, `batch_size` rows at a time, for
    /// building the Feature Index at startup.
    pub fn load_tracks(&self, batch_size: usize) -> rusqlite::Result<Vec<Track>> {
        let mut tracks = Vec::new();
        let mut offset = 0usize;
        loop {
            let mut stmt = self.conn.prepare(
                "SELECT id, title, artist, album, year, cover_url, duration_secs, path, features_json
                 FROM tracks ORDER BY id LIMIT ?1 OFFSET ?2",
            )?;
            let rows = stmt.query_map(params![batch_size as i64, offset as i64], row_to_track)?;
            let mut fetched = 0;
            for row in rows {
                tracks.push(row?);
                fetched += 1;
            }
            if fetched < batch_size {
                break;
            }
            offset += batch_size;
        }
        Ok(tracks)
    }

    pub fn insert_track(&self, track: &Track) -> rusqlite::Result<()> {
        let features_json = serde_json::to_string(&track.features).unwrap_or_default();
        self.conn.execute(
            "INSERT OR REPLACE INTO tracks
                (id, title, artist, album, year, cover_url, duration_secs, path, features_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                track.id,
                track.title,
                track.artist,
                track.album,
                track.year,
                track.cover_url,
                track.duration_secs,
                track.path.to_string_lossy(),
                features_json,
            ],
        )?;
        Ok(())
    }

    /// Records an explicit user rating (1-5). Called only from the
    /// `POST /session/...` rate action the client dispatches; never from
    /// inside the Session Engine itself.
    pub fn record_rating(&self, track_id: &str, score: i64, rated_at_unix: i64) -> rusqlite::Result<()> {
        self.conn.execute(
            "INSERT INTO ratings (track_id, score, rated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(track_id) DO UPDATE SET score = excluded.score, rated_at = excluded.rated_at",
            params![track_id, score, rated_at_unix],
        )?;
        Ok(())
    }

    /// Increments play stats when a track has been heard in full (driven by
    /// the mixer's `onTrackCommitted` callback reaching the *next*
    /// transition, i.e. the track genuinely finished).
    pub fn record_completion(&self, track_id: &str, completed_at_unix: i64) -> rusqlite::Result<()> {
        self.conn.execute(
            "INSERT INTO play_stats (track_id, play_count, complete_count, last_played_at)
             VALUES (?1, 1, 1, ?2)
             ON CONFLICT(track_id) DO UPDATE SET
                play_count = play_count + 1,
                complete_count = complete_count + 1,
                last_played_at = excluded.last_played_at",
            params![track_id, completed_at_unix],
        )?;
        Ok(())
    }

    pub fn fuzzy_search(&self, query: &str, limit: usize) -> rusqlite::Result<Vec<Track>> {
        let pattern = format!("%{}%", query.replace('%', "").replace('_', ""));
        let mut stmt = self.conn.prepare(
            "SELECT id, title, artist, album, year, cover_url, duration_secs, path, features_json
             FROM tracks
             WHERE title LIKE ?1 COLLATE NOCASE OR artist LIKE ?1 COLLATE NOCASE OR album LIKE ?1 COLLATE NOCASE
             ORDER BY title LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![pattern, limit as i64], row_to_track)?;
        rows.collect()
    }

    pub fn get_track(&self, id: &str) -> rusqlite::Result<Option<Track>> {
        self.conn
            .query_row(
                "SELECT id, title, artist, album, year, cover_url, duration_secs, path, features_json
                 FROM tracks WHERE id = ?1",
                params![id],
                row_to_track,
            )
            .optional()
    }
}

fn row_to_track(row: &rusqlite::Row<'_>) -> rusqlite::Result<Track> {
    let features_json: String = row.get(8)?;
    let features: FeatureVector = serde_json::from_str(&features_json).unwrap_or_default();
    Ok(Track {
        id: row.get(0)?,
        title: row.get(1)?,
        artist: row.get(2)?,
        album: row.get(3)?,
        year: row.get(4)?,
        cover_url: row.get(5)?,
        duration_secs: row.get(6)?,
        path: std::path::PathBuf::from(row.get::<_, String>(7)?),
        features,
    })
}
