//! Versioned object store.
//!
//! A bare git repository with a single linear branch. Staged writes collect
//! in an in-memory scratch area; `commit` turns every staged file into a
//! blob, rebuilds the `entry/` and `source/` subtrees from the persistent
//! hash maps, and advances `refs/heads/master` by exactly one commit whose
//! parent is the previous head. The hash maps are the source of truth for
//! which blobs exist under each subtree, so deletions are just map removals
//! followed by a commit.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use git2::{Oid, Repository, Signature};
use thiserror::Error;
use uuid::Uuid;

use crate::atom::read::{parse_entry, parse_feed, ReadError};
use crate::atom::validate::ValidateError;
use crate::atom::write::{break_lines, write_entry, write_source_feed, WriteError, XML_PROLOG};
use crate::atom::{Entry, Feed, Source, SourceProjection, Uri};

pub const BRANCH_REF: &str = "refs/heads/master";

const BOT_NAME: &str = "atompub-git-bot";
const BOT_EMAIL: &str = "atompub-git-bot@localhost";
const INIT_MESSAGE: &str = "init commit";

const PRE_RECEIVE_HOOK: &str = "#!/bin/sh
echo \"atompub-server git backend is read-only.\"
exit 1";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("git: {0}")]
    Git(#[from] git2::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot encode blob: {0}")]
    Encode(#[from] WriteError),

    #[error("cannot decode {name}: {source}")]
    Decode {
        name: String,
        #[source]
        source: ReadError,
    },

    #[error("stored {name} fails validation: {source}")]
    Invalid {
        name: String,
        #[source]
        source: ValidateError,
    },

    #[error("cannot parse {0} as urn:uuid")]
    BadId(String),

    #[error("entry without a source: {0}")]
    OrphanEntry(String),

    #[error("stored source {0} is missing id, updated or title")]
    IncompleteSource(String),
}

/// Everything the latest commit holds, keyed the way the model indexes it.
pub struct Corpus {
    /// `(/feed/<uuid>, source)`
    pub sources: Vec<(String, Source)>,
    /// `(/entry/<uuid>, /feed/<uuid>, entry)`
    pub entries: Vec<(String, String, Entry)>,
}

#[derive(Default)]
struct Area {
    staged: BTreeMap<String, Vec<u8>>,
    hashes: BTreeMap<String, Oid>,
}

pub struct GitStore {
    repo: Repository,
    entry: Area,
    source: Area,
}

fn file_uuid(id: &Uri) -> Result<Uuid, StoreError> {
    Uuid::parse_str(&id.target).map_err(|_| StoreError::BadId(id.target.clone()))
}

fn source_from_feed(name: &str, feed: Feed) -> Result<Source, StoreError> {
    let incomplete = || StoreError::IncompleteSource(name.to_string());
    Ok(Source {
        id: feed.id.ok_or_else(incomplete)?,
        updated: feed.updated.ok_or_else(incomplete)?,
        title: feed.title.ok_or_else(incomplete)?,
        authors: feed.authors,
        links: feed.links,
        categories: feed.categories,
        contributors: feed.contributors,
        icon: feed.icon,
        logo: feed.logo,
        generator: feed.generator,
        subtitle: feed.subtitle,
        rights: feed.rights,
    })
}

impl GitStore {
    /// Open the repository at `gitdir`, creating a bare one (with a
    /// push-refusing pre-receive hook) and an empty init commit when absent.
    pub fn open(gitdir: &Path) -> Result<Self, StoreError> {
        let repo = match Repository::open(gitdir) {
            Ok(repo) => repo,
            Err(_) => {
                let repo = Repository::init_bare(gitdir)?;
                let hooks = gitdir.join("hooks");
                fs::create_dir_all(&hooks)?;
                let hook = hooks.join("pre-receive");
                fs::write(&hook, PRE_RECEIVE_HOOK)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    fs::set_permissions(&hook, fs::Permissions::from_mode(0o744))?;
                }
                repo
            }
        };

        if repo.refname_to_id(BRANCH_REF).is_err() {
            let tree_oid = repo.treebuilder(None)?.write()?;
            let tree = repo.find_tree(tree_oid)?;
            let sig = Signature::now(BOT_NAME, BOT_EMAIL)?;
            let oid = repo.commit(None, &sig, &sig, INIT_MESSAGE, &tree, &[])?;
            repo.reference(BRANCH_REF, oid, true, INIT_MESSAGE)?;
            repo.set_head(BRANCH_REF)?;
        }

        let mut entry = Area::default();
        let mut source = Area::default();
        {
            let head = repo.find_commit(repo.refname_to_id(BRANCH_REF)?)?;
            let tree = head.tree()?;
            for (dir, area) in [("entry", &mut entry), ("source", &mut source)] {
                let Some(item) = tree.get_name(dir) else { continue };
                let subtree = repo.find_tree(item.id())?;
                for child in subtree.iter() {
                    if let Some(name) = child.name() {
                        area.hashes.insert(name.to_string(), child.id());
                    }
                }
            }
        }

        Ok(GitStore { repo, entry, source })
    }

    /// Decode the whole corpus reachable from the latest commit.
    ///
    /// Sources come first: entries reference their feed by the embedded
    /// source id, and an entry whose source is absent is a hard error.
    pub fn load(&self) -> Result<Corpus, StoreError> {
        let mut sources = Vec::new();
        for (name, oid) in &self.source.hashes {
            let blob = self.repo.find_blob(*oid)?;
            let feed = parse_feed(blob.content()).map_err(|e| StoreError::Decode {
                name: format!("source/{name}"),
                source: e,
            })?;
            let source = source_from_feed(name, feed)?;
            let uuid = file_uuid(&source.id)?;
            sources.push((format!("/feed/{uuid}"), source));
        }

        let mut entries = Vec::new();
        for (name, oid) in &self.entry.hashes {
            let blob = self.repo.find_blob(*oid)?;
            let mut entry = parse_entry(blob.content()).map_err(|e| StoreError::Decode {
                name: format!("entry/{name}"),
                source: e,
            })?;
            entry.content.body.retain(|&b| b != b'\n');
            entry
                .validate(None, entry.source.as_ref())
                .map_err(|e| StoreError::Invalid {
                    name: format!("entry/{name}"),
                    source: e,
                })?;
            let projection = entry
                .source
                .as_ref()
                .ok_or_else(|| StoreError::OrphanEntry(name.clone()))?;
            let feed_path = format!("/feed/{}", file_uuid(&projection.id)?);
            if !sources.iter().any(|(path, _)| path == &feed_path) {
                return Err(StoreError::OrphanEntry(name.clone()));
            }
            let entry_path = format!("/entry/{}", file_uuid(&entry.id)?);
            entries.push((entry_path, feed_path, entry));
        }

        Ok(Corpus { sources, entries })
    }

    pub fn stage_source(&mut self, source: &Source) -> Result<(), StoreError> {
        let uuid = file_uuid(&source.id)?;
        let mut buf = XML_PROLOG.as_bytes().to_vec();
        write_source_feed(&mut buf, source)?;
        self.source.staged.insert(format!("{uuid}.atom"), break_lines(&buf));
        Ok(())
    }

    pub fn stage_entry(
        &mut self,
        entry: &Entry,
        source: &SourceProjection,
    ) -> Result<(), StoreError> {
        let uuid = file_uuid(&entry.id)?;
        let mut buf = XML_PROLOG.as_bytes().to_vec();
        write_entry(&mut buf, entry, Some(source), None)?;
        self.entry.staged.insert(format!("{uuid}.atom"), break_lines(&buf));
        Ok(())
    }

    pub fn unstage_source(&mut self, id: &Uri) -> Result<(), StoreError> {
        let uuid = file_uuid(id)?;
        self.source.hashes.remove(&format!("{uuid}.atom"));
        Ok(())
    }

    pub fn unstage_entry(&mut self, id: &Uri) -> Result<(), StoreError> {
        let uuid = file_uuid(id)?;
        self.entry.hashes.remove(&format!("{uuid}.atom"));
        Ok(())
    }

    /// Blob every staged file, rebuild both subtrees and the root tree, and
    /// advance the branch by one commit. The committer ident of the previous
    /// commit is carried forward with a fresh timestamp.
    pub fn commit(&mut self, message: &str) -> Result<(), StoreError> {
        flush_area(&self.repo, &mut self.entry)?;
        flush_area(&self.repo, &mut self.source)?;

        let entry_tree = write_subtree(&self.repo, &self.entry.hashes)?;
        let source_tree = write_subtree(&self.repo, &self.source.hashes)?;
        let mut root = self.repo.treebuilder(None)?;
        root.insert("entry", entry_tree, 0o040000)?;
        root.insert("source", source_tree, 0o040000)?;
        let tree = self.repo.find_tree(root.write()?)?;

        let parent = self.repo.find_commit(self.repo.refname_to_id(BRANCH_REF)?)?;
        let parent_author = parent.author();
        let parent_committer = parent.committer();
        let author = Signature::now(
            parent_author.name().unwrap_or(BOT_NAME),
            parent_author.email().unwrap_or(BOT_EMAIL),
        )?;
        let committer = Signature::now(
            parent_committer.name().unwrap_or(BOT_NAME),
            parent_committer.email().unwrap_or(BOT_EMAIL),
        )?;
        self.repo
            .commit(Some(BRANCH_REF), &author, &committer, message, &tree, &[&parent])?;
        Ok(())
    }
}

// A staged file is forgotten only once its blob exists, so a failed commit
// leaves the remaining staged files for the next attempt.
fn flush_area(repo: &Repository, area: &mut Area) -> Result<(), StoreError> {
    while let Some(entry) = area.staged.first_entry() {
        let oid = repo.blob(entry.get())?;
        let (name, _) = entry.remove_entry();
        area.hashes.insert(name, oid);
    }
    Ok(())
}

fn write_subtree(repo: &Repository, hashes: &BTreeMap<String, Oid>) -> Result<Oid, StoreError> {
    let mut builder = repo.treebuilder(None)?;
    for (name, oid) in hashes {
        builder.insert(name.as_str(), *oid, 0o100644)?;
    }
    Ok(builder.write()?)
}
