//! Listing the data objects of a token.
use std::{slice, vec};

use log::trace;

use crate::error::DataResult;
use crate::provider::{AttributeFilter, AttributeKind, Connection, ObjectClass};

use super::locate::find_all;
use super::marshal::fetch_value;

//------------ DataId --------------------------------------------------------

/// The identity of a data object: its application and its label.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DataId {
    pub application: String,
    pub label: String,
}

impl DataId {
    pub fn new(application: impl Into<String>, label: impl Into<String>) -> Self {
        DataId {
            application: application.into(),
            label: label.into(),
        }
    }
}

//------------ DataIdList ----------------------------------------------------

/// The identities of all data objects visible on a token.
///
/// The order of the entries is not specified. All memory held by the
/// list is released when it is dropped.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DataIdList(Vec<DataId>);

impl DataIdList {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> slice::Iter<'_, DataId> {
        self.0.iter()
    }

    pub fn contains(&self, id: &DataId) -> bool {
        self.0.contains(id)
    }

    /// Releases the list. Same as dropping it.
    pub fn free(self) {}
}

impl IntoIterator for DataIdList {
    type Item = DataId;
    type IntoIter = vec::IntoIter<DataId>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a DataIdList {
    type Item = &'a DataId;
    type IntoIter = slice::Iter<'a, DataId>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

//------------ build_list ----------------------------------------------------

/// Builds a fresh list of all data objects visible through the connection.
///
/// Either every found object makes it into the list or the list is dropped
/// and the error returned. Partial lists are never handed out.
pub fn build_list<C: Connection>(conn: &mut C) -> DataResult<DataIdList> {
    let objects = find_all(conn, &AttributeFilter::class(ObjectClass::DATA))?;
    trace!("Found {} data objects", objects.len());

    let mut ids = Vec::new();
    ids.try_reserve_exact(objects.len())?;
    for object in objects {
        let application = fetch_value(conn, object, AttributeKind::Application)?;
        let label = fetch_value(conn, object, AttributeKind::Label)?;
        ids.push(DataId {
            application: application.into_string(),
            label: label.into_string(),
        });
    }
    Ok(DataIdList(ids))
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::provider::{Attribute, Rv, memory::MemoryToken};

    fn put(token: &MemoryToken, application: &str, label: &str) {
        token
            .connect()
            .create_object(&[
                Attribute::Class(ObjectClass::DATA),
                Attribute::Application(application.as_bytes().to_vec()),
                Attribute::Label(label.as_bytes().to_vec()),
                Attribute::Value(b"v".to_vec()),
            ])
            .unwrap();
    }

    #[test]
    fn empty_token_gives_empty_list() {
        let token = MemoryToken::new();
        let list = build_list(&mut token.connect()).unwrap();
        assert!(list.is_empty());
        assert_eq!(list.iter().count(), 0);
    }

    #[test]
    fn lists_data_objects_only() {
        let token = MemoryToken::new();
        put(&token, "app", "one");
        put(&token, "other", "two");
        token
            .connect()
            .create_object(&[
                Attribute::Class(ObjectClass::CERTIFICATE),
                Attribute::Label(b"cert".to_vec()),
            ])
            .unwrap();

        let list = build_list(&mut token.connect()).unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.contains(&DataId::new("app", "one")));
        assert!(list.contains(&DataId::new("other", "two")));
    }

    #[test]
    fn missing_label_fails_the_whole_list() {
        let token = MemoryToken::new();
        put(&token, "app", "one");
        token
            .connect()
            .create_object(&[
                Attribute::Class(ObjectClass::DATA),
                Attribute::Application(b"app".to_vec()),
            ])
            .unwrap();

        assert_eq!(
            build_list(&mut token.connect()),
            Err(Error::AttributeUnavailable(AttributeKind::Label))
        );
    }

    #[test]
    fn attribute_read_failure_is_returned() {
        let token = MemoryToken::new();
        put(&token, "app", "one");

        token.fail_next("C_GetAttributeValue", Rv::USER_NOT_LOGGED_IN);
        let err = build_list(&mut token.connect()).unwrap_err();
        assert!(matches!(err, Error::Provider(ref e) if e.rv() == Rv::USER_NOT_LOGGED_IN));
    }
}
