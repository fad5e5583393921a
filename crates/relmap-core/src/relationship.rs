//! Relationship metadata and cascade policies.
//!
//! Relationships are declared per table and resolved by the
//! [`SchemaRegistry`](crate::SchemaRegistry) before any session uses them.

use crate::error::{Error, SchemaErrorKind};

/// The type of relationship between two tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RelationshipKind {
    /// One-to-one: `User` has one `Profile`.
    OneToOne,
    /// Many-to-one: many `Post`s belong to one `User`.
    #[default]
    ManyToOne,
    /// One-to-many: one `User` has many `Post`s.
    OneToMany,
    /// Many-to-many: `Post`s have many `Tag`s via a link table.
    ManyToMany,
}

impl RelationshipKind {
    /// Whether the relationship holds a collection on this side.
    pub const fn is_collection(&self) -> bool {
        matches!(self, RelationshipKind::OneToMany | RelationshipKind::ManyToMany)
    }

    /// The kind seen from the other side.
    pub const fn inverse(&self) -> Self {
        match self {
            RelationshipKind::OneToOne => RelationshipKind::OneToOne,
            RelationshipKind::ManyToOne => RelationshipKind::OneToMany,
            RelationshipKind::OneToMany => RelationshipKind::ManyToOne,
            RelationshipKind::ManyToMany => RelationshipKind::ManyToMany,
        }
    }
}

/// Information about a link table for many-to-many relationships.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTableInfo {
    /// The link table name (e.g., `"post_tags"`).
    pub table_name: &'static str,

    /// Column in the link table pointing to the declaring table (e.g., `"post_id"`).
    pub local_column: &'static str,

    /// Column in the link table pointing to the related table (e.g., `"tag_id"`).
    pub remote_column: &'static str,
}

impl LinkTableInfo {
    #[must_use]
    pub const fn new(
        table_name: &'static str,
        local_column: &'static str,
        remote_column: &'static str,
    ) -> Self {
        Self {
            table_name,
            local_column,
            remote_column,
        }
    }

    /// The same link table seen from the other side.
    #[must_use]
    pub const fn flipped(&self) -> Self {
        Self {
            table_name: self.table_name,
            local_column: self.remote_column,
            remote_column: self.local_column,
        }
    }
}

/// Metadata about a relationship between tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationshipInfo {
    /// Name of the relationship.
    pub name: &'static str,

    /// The related table.
    pub related_table: &'static str,

    /// Kind of relationship.
    pub kind: RelationshipKind,

    /// Foreign key column on this table (ManyToOne, owning OneToOne).
    pub local_key: Option<&'static str>,

    /// Foreign key column on the related table (OneToMany, inverse OneToOne).
    pub remote_key: Option<&'static str>,

    /// Link table for ManyToMany relationships.
    pub link_table: Option<LinkTableInfo>,

    /// The relationship on the related table that points back.
    pub back_populates: Option<&'static str>,

    /// Cascade options string (e.g., "all, delete-orphan").
    pub cascade: Option<&'static str>,

    /// Ordering applied when loading the collection (e.g., "title", "id DESC").
    pub order_by: Option<&'static str>,
}

impl RelationshipInfo {
    /// Create a new relationship with required fields.
    #[must_use]
    pub const fn new(
        name: &'static str,
        related_table: &'static str,
        kind: RelationshipKind,
    ) -> Self {
        Self {
            name,
            related_table,
            kind,
            local_key: None,
            remote_key: None,
            link_table: None,
            back_populates: None,
            cascade: None,
            order_by: None,
        }
    }

    pub const fn local_key(mut self, key: &'static str) -> Self {
        self.local_key = Some(key);
        self
    }

    pub const fn remote_key(mut self, key: &'static str) -> Self {
        self.remote_key = Some(key);
        self
    }

    pub const fn link_table(mut self, info: LinkTableInfo) -> Self {
        self.link_table = Some(info);
        self
    }

    pub const fn back_populates(mut self, field: &'static str) -> Self {
        self.back_populates = Some(field);
        self
    }

    pub const fn cascade(mut self, opts: &'static str) -> Self {
        self.cascade = Some(opts);
        self
    }

    pub const fn order_by(mut self, ordering: &'static str) -> Self {
        self.order_by = Some(ordering);
        self
    }

    /// Parse the cascade string; relationships without one get the default
    /// `save-update, merge` policy.
    pub fn cascade_policy(&self) -> crate::Result<Cascade> {
        match self.cascade {
            Some(opts) => Cascade::parse(opts),
            None => Ok(Cascade::default()),
        }
    }
}

/// Resolved cascade flags for one relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cascade {
    pub save_update: bool,
    pub merge: bool,
    pub delete: bool,
    pub delete_orphan: bool,
    pub expunge: bool,
    pub refresh_expire: bool,
}

impl Default for Cascade {
    fn default() -> Self {
        Self {
            save_update: true,
            merge: true,
            ..Self::NONE
        }
    }
}

impl Cascade {
    pub const NONE: Cascade = Cascade {
        save_update: false,
        merge: false,
        delete: false,
        delete_orphan: false,
        expunge: false,
        refresh_expire: false,
    };

    /// Parse a comma-separated cascade string such as `"all, delete-orphan"`.
    ///
    /// `all` expands to every option except `delete-orphan`, and
    /// `delete-orphan` implies `delete`.
    pub fn parse(opts: &str) -> crate::Result<Self> {
        let mut cascade = Cascade::NONE;
        for token in opts.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token.to_ascii_lowercase().as_str() {
                "all" => {
                    cascade.save_update = true;
                    cascade.merge = true;
                    cascade.delete = true;
                    cascade.expunge = true;
                    cascade.refresh_expire = true;
                }
                "save-update" => cascade.save_update = true,
                "merge" => cascade.merge = true,
                "delete" => cascade.delete = true,
                "delete-orphan" => {
                    cascade.delete = true;
                    cascade.delete_orphan = true;
                }
                "expunge" => cascade.expunge = true,
                "refresh-expire" => cascade.refresh_expire = true,
                "none" => {}
                other => {
                    return Err(Error::schema(
                        SchemaErrorKind::Invalid,
                        format!("unknown cascade option '{other}' in \"{opts}\""),
                    ));
                }
            }
        }
        Ok(cascade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_all_delete_orphan() {
        let c = Cascade::parse("all, delete-orphan").unwrap();
        assert!(c.delete && c.delete_orphan && c.save_update && c.expunge);
    }

    #[test]
    fn delete_orphan_implies_delete() {
        let c = Cascade::parse("delete-orphan").unwrap();
        assert!(c.delete);
        assert!(!c.save_update);
    }

    #[test]
    fn default_policy_does_not_delete() {
        let rel = RelationshipInfo::new("posts", "posts", RelationshipKind::OneToMany);
        let c = rel.cascade_policy().unwrap();
        assert!(c.save_update && c.merge);
        assert!(!c.delete && !c.delete_orphan);
        assert_eq!(Cascade::parse("none").unwrap(), Cascade::NONE);
    }

    #[test]
    fn unknown_option_is_rejected() {
        let err = Cascade::parse("all, explode").unwrap_err();
        assert!(err.to_string().contains("explode"));
    }

    #[test]
    fn kind_inverse() {
        assert_eq!(RelationshipKind::OneToMany.inverse(), RelationshipKind::ManyToOne);
        assert!(RelationshipKind::ManyToMany.is_collection());
        assert!(!RelationshipKind::OneToOne.is_collection());
    }
}
