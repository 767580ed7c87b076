//! Finding token objects by attribute filter.
use log::{debug, trace};

use crate::constants::FIND_OBJECTS_BATCH_SIZE;
use crate::error::{DataResult, Error};
use crate::provider::{AttributeFilter, Connection, ObjectClass};

/// Finds the object of the given class with the given application and
/// label.
///
/// Absent application or label match any value. When several objects
/// match, the first one the provider returns is used. Finding nothing is
/// reported as [`Error::ObjectNotFound`], a failing search as the
/// provider error.
pub fn locate<C: Connection>(
    conn: &mut C,
    class: ObjectClass,
    application: Option<&str>,
    label: Option<&str>,
) -> DataResult<C::Object> {
    let filter = AttributeFilter::class(class)
        .with_application(application)
        .with_label(label);

    // Ask for two so that duplicates can at least be noticed.
    let found = search(conn, &filter, |conn| conn.find_objects(2))?;

    match found.first() {
        Some(object) => {
            if found.len() > 1 {
                debug!(
                    "More than one {} found for application {:?} label {:?}, using the first",
                    class, application, label
                );
            }
            trace!("Located {} as object {:?}", class, object);
            Ok(*object)
        }
        None => Err(Error::ObjectNotFound),
    }
}

/// Finds all objects matching the filter.
pub fn find_all<C: Connection>(
    conn: &mut C,
    filter: &AttributeFilter,
) -> DataResult<Vec<C::Object>> {
    search(conn, filter, |conn| -> DataResult<Vec<C::Object>> {
        let mut found = Vec::new();
        loop {
            let batch = conn.find_objects(FIND_OBJECTS_BATCH_SIZE)?;
            if batch.is_empty() {
                break;
            }
            found.try_reserve(batch.len())?;
            found.extend(batch);
        }
        Ok(found)
    })
}

/// Runs one search operation.
///
/// A session can have only one active search, so the search is always
/// finalized, also when fetching results failed.
fn search<C, T, E, F>(
    conn: &mut C,
    filter: &AttributeFilter,
    fetch: F,
) -> DataResult<T>
where
    C: Connection,
    Error: From<E>,
    F: FnOnce(&mut C) -> Result<T, E>,
{
    conn.find_objects_init(filter)?;
    let res = fetch(conn).map_err(Error::from);
    let fin = conn.find_objects_final();

    let found = res?;
    fin?;
    Ok(found)
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Attribute, Rv, memory::MemoryToken};

    fn put(token: &MemoryToken, application: &str, label: &str) -> u64 {
        token
            .connect()
            .create_object(&[
                Attribute::Class(ObjectClass::DATA),
                Attribute::Application(application.as_bytes().to_vec()),
                Attribute::Label(label.as_bytes().to_vec()),
                Attribute::Value(vec![1, 2, 3]),
            ])
            .unwrap()
    }

    #[test]
    fn locate_by_application_and_label() {
        let token = MemoryToken::new();
        put(&token, "app", "one");
        let two = put(&token, "app", "two");
        let mut conn = token.connect();

        assert_eq!(
            locate(&mut conn, ObjectClass::DATA, Some("app"), Some("two")).unwrap(),
            two
        );
        assert_eq!(
            locate(&mut conn, ObjectClass::DATA, Some("app"), Some("three")),
            Err(Error::ObjectNotFound)
        );
        assert_eq!(
            locate(&mut conn, ObjectClass::CERTIFICATE, None, None),
            Err(Error::ObjectNotFound)
        );
    }

    #[test]
    fn first_match_wins() {
        let token = MemoryToken::new();
        let first = put(&token, "app", "dup");
        put(&token, "app", "dup");

        let mut conn = token.connect();
        assert_eq!(
            locate(&mut conn, ObjectClass::DATA, Some("app"), Some("dup")).unwrap(),
            first
        );
    }

    #[test]
    fn empty_label_is_not_a_wildcard() {
        let token = MemoryToken::new();
        put(&token, "app", "one");
        let empty = put(&token, "app", "");
        let mut conn = token.connect();

        assert_eq!(
            locate(&mut conn, ObjectClass::DATA, Some("app"), Some("")).unwrap(),
            empty
        );
    }

    #[test]
    fn failed_search_is_a_provider_error_and_finalized() {
        let token = MemoryToken::new();
        put(&token, "app", "one");
        let mut conn = token.connect();

        token.fail_next("C_FindObjects", Rv::USER_NOT_LOGGED_IN);
        let err = locate(&mut conn, ObjectClass::DATA, Some("app"), Some("one")).unwrap_err();
        assert!(matches!(err, Error::Provider(ref e) if e.rv() == Rv::USER_NOT_LOGGED_IN));

        // The failed search did not leave the session with an active search.
        assert!(locate(&mut conn, ObjectClass::DATA, Some("app"), Some("one")).is_ok());
    }

    #[test]
    fn find_all_crosses_batches() {
        let token = MemoryToken::new();
        let count = FIND_OBJECTS_BATCH_SIZE * 2 + 3;
        for i in 0..count {
            put(&token, "app", &i.to_string());
        }

        let mut conn = token.connect();
        let found = find_all(&mut conn, &AttributeFilter::class(ObjectClass::DATA)).unwrap();
        assert_eq!(found.len(), count);
    }
}
