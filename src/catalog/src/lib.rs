use cloudstash_lib::{StashError, StashResult};
use log::warn;
use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// Inode number of the root directory, present from initialization.
pub const ROOT_INODE: i64 = 1;
/// Sentinel parent of the root directory.
pub const ROOT_PARENT: i64 = 0;

const KIND_DIRECTORY: i64 = 0;
const KIND_REGULAR: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    Regular,
}

impl FileKind {
    pub fn is_dir(&self) -> bool {
        matches!(self, FileKind::Directory)
    }
}

impl ToSql for FileKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let v = match self {
            FileKind::Directory => KIND_DIRECTORY,
            FileKind::Regular => KIND_REGULAR,
        };
        Ok(v.into())
    }
}

impl FromSql for FileKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_i64()? {
            KIND_DIRECTORY => Ok(FileKind::Directory),
            _ => Ok(FileKind::Regular),
        }
    }
}

/// One catalog row: a file or directory in the logical namespace.
///
/// `nlink` is synthetic, filled on read: directories report two plus the
/// number of child directories, regular files always report one.
#[derive(Debug, Clone, PartialEq)]
pub struct Inode {
    pub inode: i64,
    pub parent: i64,
    pub name: String,
    pub kind: FileKind,
    pub mode: u16,
    pub size: u64,
    pub url: String,
    pub hash: String,
    pub nlink: u32,
}

fn map_db_err(e: rusqlite::Error) -> StashError {
    StashError::Db(e.to_string())
}

/// The persistent inode table, stored in one sqlite file that travels as a
/// single encrypted blob on the chosen provider.
pub struct Catalog {
    conn: Mutex<Connection>,
}

impl Catalog {
    /// Creates the schema in a fresh file and inserts the root directory row.
    pub fn init(path: &Path) -> StashResult<()> {
        let conn = Connection::open(path).map_err(|e| {
            warn!("couldn't open catalog at {}: {}", path.display(), e);
            map_db_err(e)
        })?;

        conn.execute_batch(
            "CREATE TABLE files (
                inode  INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
                name   TEXT NOT NULL,
                url    TEXT NOT NULL DEFAULT \"\",
                size   INTEGER NOT NULL DEFAULT 0,
                mode   INTEGER NOT NULL,
                parent INTEGER NOT NULL,
                type   INTEGER NOT NULL,
                hash   TEXT NOT NULL DEFAULT \"\",
                UNIQUE(name, parent)
            );",
        )
        .map_err(|e| {
            warn!("couldn't create catalog schema: {}", e);
            map_db_err(e)
        })?;

        conn.execute(
            "INSERT INTO files(inode, name, mode, parent, type) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![ROOT_INODE, "", 0o755, ROOT_PARENT, FileKind::Directory],
        )
        .map_err(|e| {
            warn!("couldn't insert root row: {}", e);
            map_db_err(e)
        })?;

        Ok(())
    }

    pub fn open(path: &Path) -> StashResult<Self> {
        let conn = Connection::open(path).map_err(|e| {
            warn!("couldn't open catalog at {}: {}", path.display(), e);
            map_db_err(e)
        })?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Checks that the expected schema is present. Required before accepting
    /// a newly downloaded catalog.
    pub fn is_valid(&self) -> bool {
        let conn = self.conn.lock().unwrap();
        let ddl: Option<String> = conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = 'files'",
                [],
                |row| row.get(0),
            )
            .optional()
            .unwrap_or(None);

        match ddl {
            Some(sql) => ["inode", "name", "url", "size", "mode", "parent", "type", "hash"]
                .iter()
                .all(|col| sql.contains(col)),
            None => false,
        }
    }

    pub fn search(&self, parent: i64, name: &str) -> StashResult<Inode> {
        let conn = self.conn.lock().unwrap();
        let md = Self::query_one(
            &conn,
            "SELECT inode, name, url, size, mode, parent, type, hash FROM files
             WHERE name = ?1 AND parent = ?2",
            params![name, parent],
        )?
        .ok_or_else(|| StashError::NotFound(format!("no entry '{}' under {}", name, parent)))?;
        Self::fill_nlink(&conn, md)
    }

    pub fn get(&self, inode: i64) -> StashResult<Inode> {
        let conn = self.conn.lock().unwrap();
        let md = Self::query_one(
            &conn,
            "SELECT inode, name, url, size, mode, parent, type, hash FROM files
             WHERE inode = ?1",
            params![inode],
        )?
        .ok_or_else(|| StashError::NotFound(format!("no inode {}", inode)))?;
        Self::fill_nlink(&conn, md)
    }

    pub fn list_children(&self, parent: i64) -> StashResult<Vec<Inode>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT inode, name, url, size, mode, parent, type, hash FROM files
                 WHERE parent = ?1",
            )
            .map_err(map_db_err)?;

        let rows = stmt
            .query_map(params![parent], Self::parse_row)
            .map_err(map_db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_db_err)?;

        rows.into_iter()
            .map(|md| Self::fill_nlink(&conn, md))
            .collect()
    }

    pub fn add_directory(&self, parent: i64, name: &str, mode: u16) -> StashResult<Inode> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO files(name, mode, parent, type) VALUES (?1, ?2, ?3, ?4)",
            params![name, mode, parent, FileKind::Directory],
        )
        .map_err(|e| {
            warn!("couldn't insert directory '{}': {}", name, e);
            map_db_err(e)
        })?;

        let inode = conn.last_insert_rowid();
        let mut md = Self::query_one(
            &conn,
            "SELECT inode, name, url, size, mode, parent, type, hash FROM files
             WHERE inode = ?1",
            params![inode],
        )?
        .ok_or_else(|| StashError::Db("inserted directory row is missing".to_string()))?;

        // just created, only '.' and '..'
        md.nlink = 2;
        Ok(md)
    }

    pub fn create_file(
        &self,
        parent: i64,
        name: &str,
        mode: u16,
        url: &str,
        hash: &str,
    ) -> StashResult<Inode> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO files(name, url, size, mode, parent, type, hash)
             VALUES (?1, ?2, 0, ?3, ?4, ?5, ?6)",
            params![name, url, mode, parent, FileKind::Regular, hash],
        )
        .map_err(|e| {
            warn!("couldn't insert file '{}': {}", name, e);
            map_db_err(e)
        })?;

        let inode = conn.last_insert_rowid();
        let mut md = Self::query_one(
            &conn,
            "SELECT inode, name, url, size, mode, parent, type, hash FROM files
             WHERE inode = ?1",
            params![inode],
        )?
        .ok_or_else(|| StashError::Db("inserted file row is missing".to_string()))?;

        // hard links are not supported
        md.nlink = 1;
        Ok(md)
    }

    /// Full-row update by primary key.
    pub fn update(&self, md: &Inode) -> StashResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE files SET name = ?1, url = ?2, size = ?3, mode = ?4, parent = ?5,
             type = ?6, hash = ?7 WHERE inode = ?8",
            params![
                md.name,
                md.url,
                md.size as i64,
                md.mode,
                md.parent,
                md.kind,
                md.hash,
                md.inode
            ],
        )
        .map_err(|e| {
            warn!("couldn't update inode {}: {}", md.inode, e);
            map_db_err(e)
        })?;
        Ok(())
    }

    /// Insert letting sqlite allocate a fresh inode number.
    pub fn insert(&self, md: &Inode) -> StashResult<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO files(name, url, size, mode, parent, type, hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                md.name,
                md.url,
                md.size as i64,
                md.mode,
                md.parent,
                md.kind,
                md.hash
            ],
        )
        .map_err(|e| {
            warn!("couldn't insert row '{}': {}", md.name, e);
            map_db_err(e)
        })?;
        Ok(conn.last_insert_rowid())
    }

    /// Insert preserving the primary-key value; used by the merge scan to
    /// adopt remote inode numbers.
    pub fn force_insert(&self, md: &Inode) -> StashResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO files(inode, name, url, size, mode, parent, type, hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                md.inode,
                md.name,
                md.url,
                md.size as i64,
                md.mode,
                md.parent,
                md.kind,
                md.hash
            ],
        )
        .map_err(|e| {
            warn!("couldn't force insert inode {}: {}", md.inode, e);
            map_db_err(e)
        })?;
        Ok(())
    }

    pub fn delete(&self, inode: i64) -> StashResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM files WHERE inode = ?1", params![inode])
            .map_err(|e| {
                warn!("couldn't delete inode {}: {}", inode, e);
                map_db_err(e)
            })?;
        Ok(())
    }

    pub fn delete_children(&self, parent: i64) -> StashResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM files WHERE parent = ?1", params![parent])
            .map_err(|e| {
                warn!("couldn't delete children of {}: {}", parent, e);
                map_db_err(e)
            })?;
        Ok(())
    }

    pub fn count_rows(&self) -> StashResult<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))
            .map_err(map_db_err)?;
        Ok(count as usize)
    }

    /// Rows in stable inode order, for the chunked merge scan.
    pub fn get_rows(&self, limit: usize, offset: usize) -> StashResult<Vec<Inode>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT inode, name, url, size, mode, parent, type, hash FROM files
                 ORDER BY inode LIMIT ?1 OFFSET ?2",
            )
            .map_err(map_db_err)?;

        let rows = stmt
            .query_map(params![limit as i64, offset as i64], Self::parse_row)
            .map_err(map_db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_db_err)?;
        Ok(rows)
    }

    fn query_one(
        conn: &Connection,
        sql: &str,
        args: &[&dyn ToSql],
    ) -> StashResult<Option<Inode>> {
        conn.query_row(sql, args, Self::parse_row)
            .optional()
            .map_err(map_db_err)
    }

    fn parse_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Inode> {
        Ok(Inode {
            inode: row.get(0)?,
            name: row.get(1)?,
            url: row.get(2)?,
            size: row.get::<_, i64>(3)? as u64,
            mode: row.get::<_, u16>(4)?,
            parent: row.get(5)?,
            kind: row.get(6)?,
            hash: row.get(7)?,
            nlink: 0,
        })
    }

    fn fill_nlink(conn: &Connection, mut md: Inode) -> StashResult<Inode> {
        if md.kind == FileKind::Regular {
            md.nlink = 1;
            return Ok(md);
        }

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM files WHERE parent = ?1 AND type = ?2",
                params![md.inode, FileKind::Directory],
                |row| row.get(0),
            )
            .map_err(map_db_err)?;

        // '.' and '..' on top of the child directories
        md.nlink = count as u32 + 2;
        Ok(md)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn new_catalog() -> (Catalog, TempDir) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("catalog.sqlite3");
        Catalog::init(&path).unwrap();
        (Catalog::open(&path).unwrap(), tmp)
    }

    #[test]
    fn test_init_creates_root() {
        let (cat, _tmp) = new_catalog();
        let root = cat.get(ROOT_INODE).unwrap();
        assert_eq!(root.inode, ROOT_INODE);
        assert_eq!(root.parent, ROOT_PARENT);
        assert_eq!(root.name, "");
        assert_eq!(root.kind, FileKind::Directory);
        assert_eq!(root.mode, 0o755);
        assert_eq!(root.nlink, 2);
        assert!(cat.is_valid());
    }

    #[test]
    fn test_directory_rows_are_empty_shaped() {
        let (cat, _tmp) = new_catalog();
        let dir = cat.add_directory(ROOT_INODE, "docs", 0o755).unwrap();
        assert_eq!(dir.kind, FileKind::Directory);
        assert_eq!(dir.size, 0);
        assert_eq!(dir.url, "");
        assert_eq!(dir.hash, "");
    }

    #[test]
    fn test_search_and_children_invariants() {
        let (cat, _tmp) = new_catalog();
        let dir = cat.add_directory(ROOT_INODE, "d", 0o755).unwrap();
        cat.create_file(dir.inode, "a.txt", 0o644, "mem://a.dat", "h1")
            .unwrap();
        cat.create_file(dir.inode, "b.txt", 0o644, "mem://b.dat", "h2")
            .unwrap();

        let found = cat.search(dir.inode, "a.txt").unwrap();
        assert_eq!(found.name, "a.txt");
        assert_eq!(found.nlink, 1);

        let children = cat.list_children(dir.inode).unwrap();
        assert_eq!(children.len(), 2);
        for child in &children {
            assert_eq!(child.parent, dir.inode);
        }

        assert!(cat.search(dir.inode, "missing").unwrap_err().is_not_found());
    }

    #[test]
    fn test_nlink_counts_child_directories() {
        let (cat, _tmp) = new_catalog();
        let dir = cat.add_directory(ROOT_INODE, "top", 0o755).unwrap();
        cat.add_directory(dir.inode, "sub1", 0o755).unwrap();
        cat.add_directory(dir.inode, "sub2", 0o755).unwrap();
        cat.create_file(dir.inode, "f", 0o644, "mem://f.dat", "").unwrap();

        let fetched = cat.get(dir.inode).unwrap();
        assert_eq!(fetched.nlink, 4);
    }

    #[test]
    fn test_unique_name_under_parent() {
        let (cat, _tmp) = new_catalog();
        cat.create_file(ROOT_INODE, "x", 0o644, "mem://1.dat", "")
            .unwrap();
        assert!(cat
            .create_file(ROOT_INODE, "x", 0o644, "mem://2.dat", "")
            .is_err());
        // the same name under another parent is fine
        let dir = cat.add_directory(ROOT_INODE, "d", 0o755).unwrap();
        cat.create_file(dir.inode, "x", 0o644, "mem://3.dat", "")
            .unwrap();
    }

    #[test]
    fn test_rename_round_trip_restores_row() {
        let (cat, _tmp) = new_catalog();
        let a = cat.add_directory(ROOT_INODE, "a", 0o755).unwrap();
        let b = cat.add_directory(ROOT_INODE, "b", 0o755).unwrap();
        let original = cat
            .create_file(a.inode, "x", 0o644, "mem://x.dat", "h")
            .unwrap();

        let mut moved = original.clone();
        moved.parent = b.inode;
        moved.name = "y".to_string();
        cat.update(&moved).unwrap();
        assert!(cat.search(a.inode, "x").unwrap_err().is_not_found());
        assert_eq!(cat.search(b.inode, "y").unwrap().inode, original.inode);

        cat.update(&original).unwrap();
        assert_eq!(cat.search(a.inode, "x").unwrap(), original);
    }

    #[test]
    fn test_rmdir_then_mkdir_gets_fresh_inode() {
        let (cat, _tmp) = new_catalog();
        let first = cat.add_directory(ROOT_INODE, "d", 0o755).unwrap();
        cat.delete(first.inode).unwrap();
        let second = cat.add_directory(ROOT_INODE, "d", 0o755).unwrap();
        assert_ne!(first.inode, second.inode);
    }

    #[test]
    fn test_delete_children() {
        let (cat, _tmp) = new_catalog();
        let dir = cat.add_directory(ROOT_INODE, "d", 0o755).unwrap();
        cat.create_file(dir.inode, "a", 0o644, "mem://a.dat", "")
            .unwrap();
        cat.create_file(dir.inode, "b", 0o644, "mem://b.dat", "")
            .unwrap();
        cat.delete_children(dir.inode).unwrap();
        assert!(cat.list_children(dir.inode).unwrap().is_empty());
    }

    #[test]
    fn test_get_rows_and_count() {
        let (cat, _tmp) = new_catalog();
        for i in 0..5 {
            cat.create_file(ROOT_INODE, &format!("f{}", i), 0o644, "mem://f.dat", "")
                .unwrap();
        }
        let total = cat.count_rows().unwrap();
        assert_eq!(total, 6); // root + 5 files

        let page = cat.get_rows(3, 0).unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].inode, ROOT_INODE);

        let rest = cat.get_rows(10, 3).unwrap();
        assert_eq!(rest.len(), 3);
    }

    #[test]
    fn test_force_insert_preserves_inode() {
        let (cat, _tmp) = new_catalog();
        let md = Inode {
            inode: 4242,
            parent: ROOT_INODE,
            name: "adopted".to_string(),
            kind: FileKind::Regular,
            mode: 0o644,
            size: 77,
            url: "mem://adopted.dat".to_string(),
            hash: "deadbeef".to_string(),
            nlink: 0,
        };
        cat.force_insert(&md).unwrap();
        let fetched = cat.get(4242).unwrap();
        assert_eq!(fetched.name, "adopted");
        assert_eq!(fetched.size, 77);
    }

    #[test]
    fn test_is_valid_rejects_foreign_schema() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("other.sqlite3");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE notes (id INTEGER PRIMARY KEY);")
            .unwrap();
        drop(conn);

        let cat = Catalog::open(&path).unwrap();
        assert!(!cat.is_valid());
    }
}
