use chrono::Utc;
use tracing::debug;

use higgstv_types::collections::USERS;
use higgstv_types::ident;
use higgstv_types::models::{User, UserBasicInfo};

use super::{now, require_match};
use crate::dsl::{Filter, FindOptions, Update};
use crate::error::Result;
use crate::store::{Collection, CollectionExt, CollectionSource, Store};

pub struct UserRepository<'a> {
    store: &'a dyn Store,
}

impl<'a> UserRepository<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store }
    }

    fn users(&self) -> Result<Box<dyn Collection + 'a>> {
        self.store.collection(USERS)
    }

    pub fn find_by_id(&self, id: &str) -> Result<User> {
        self.users()?.find_one_as(&Filter::by_id(id))
    }

    pub fn find_by_username(&self, username: &str) -> Result<User> {
        self.users()?.find_one_as(&Filter::new().eq("username", username))
    }

    pub fn find_by_email(&self, email: &str) -> Result<User> {
        self.users()?.find_one_as(&Filter::new().eq("email", email))
    }

    pub fn find_by_access_key(&self, access_key: &str) -> Result<User> {
        self.users()?.find_one_as(&Filter::new().eq("access_key", access_key))
    }

    /// Whether the username or the email is already taken.
    pub fn exists(&self, username: &str, email: &str) -> Result<bool> {
        let filter = Filter::new().or(vec![
            Filter::new().eq("username", username),
            Filter::new().eq("email", email),
        ]);
        Ok(self.users()?.count_documents(&filter)? > 0)
    }

    /// Insert a new user, minting its id and stamping both timestamps.
    /// A taken username or email fails with a duplicate-key error.
    pub fn create(&self, mut user: User) -> Result<User> {
        if user.id.is_empty() {
            user.id = ident::new_id();
        }
        let stamp = Utc::now();
        user.created = stamp;
        user.last_modified = stamp;

        self.users()?.insert_as(&user)?;
        debug!("Created user {} ({})", user.username, user.id);
        Ok(user)
    }

    pub fn update_password(&self, user_id: &str, password_hash: &str) -> Result<()> {
        let update = Update::new().set("password", password_hash).set("last_modified", now());
        let res = self.users()?.update_one(&Filter::by_id(user_id), &update)?;
        require_match(res, || format!("user {}", user_id))?;
        Ok(())
    }

    pub fn set_access_key(&self, email: &str, access_key: &str) -> Result<()> {
        let update = Update::new().set("access_key", access_key).set("last_modified", now());
        let res = self.users()?.update_one(&Filter::new().eq("email", email), &update)?;
        require_match(res, || format!("user with email {}", email))?;
        Ok(())
    }

    pub fn clear_access_key(&self, email: &str) -> Result<()> {
        let update = Update::new().unset("access_key").set("last_modified", now());
        let res = self.users()?.update_one(&Filter::new().eq("email", email), &update)?;
        require_match(res, || format!("user with email {}", email))?;
        Ok(())
    }

    /// Replace the password if `access_key` is the pending reset key for
    /// `email`, consuming the key. Returns false when it is not.
    pub fn change_password_with_access_key(&self, email: &str, access_key: &str, password_hash: &str) -> Result<bool> {
        let filter = Filter::new().eq("email", email).eq("access_key", access_key);
        let update = Update::new()
            .set("password", password_hash)
            .unset("access_key")
            .set("last_modified", now());
        let res = self.users()?.update_one(&filter, &update)?;
        Ok(res.matched > 0)
    }

    pub fn add_channel(&self, username: &str, channel_id: &str) -> Result<()> {
        let update = Update::new().add_to_set("own_channels", channel_id).set("last_modified", now());
        let res = self.users()?.update_one(&Filter::new().eq("username", username), &update)?;
        require_match(res, || format!("user {}", username))?;
        Ok(())
    }

    pub fn set_unclassified_channel(&self, username: &str, channel_id: &str) -> Result<()> {
        let update = Update::new()
            .set("unclassified_channel", channel_id)
            .set("last_modified", now());
        let res = self.users()?.update_one(&Filter::new().eq("username", username), &update)?;
        require_match(res, || format!("user {}", username))?;
        Ok(())
    }

    /// Public profile of each listed user that exists.
    pub fn basic_info(&self, user_ids: &[String]) -> Result<Vec<UserBasicInfo>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let users: Vec<User> = self
            .users()?
            .find_as(&Filter::new().is_in("_id", user_ids.iter().cloned()), &FindOptions::default())?;
        Ok(users
            .into_iter()
            .map(|u| UserBasicInfo {
                id: u.id,
                username: u.username,
                email: u.email,
            })
            .collect())
    }
}
