use std::sync::Arc;

use crate::auth::{AuthProvider, SessionContext};
use crate::backend::Backend;
use crate::changefeed::ChangeFeedHub;
use crate::comments::CommentService;
use crate::config::Config;
use crate::error::AppError;
use crate::interactions::Reconciler;
use crate::posts::PostService;
use crate::profiles::ProfileService;
use crate::storage::MediaStore;

/// Composition root: one backend, one media store, one identity provider,
/// one session context, one change-feed hub. Services are cheap handles
/// over shared `Arc`s.
#[derive(Clone)]
pub struct Foodie {
    backend: Arc<dyn Backend>,
    media: Arc<dyn MediaStore>,
    auth: Arc<dyn AuthProvider>,
    session: SessionContext,
    feed: ChangeFeedHub,
    reconciler: Reconciler,
}

impl Foodie {
    pub fn from_parts(
        backend: Arc<dyn Backend>,
        media: Arc<dyn MediaStore>,
        auth: Arc<dyn AuthProvider>,
        session: SessionContext,
        feed: ChangeFeedHub,
    ) -> Self {
        let reconciler = Reconciler::new(backend.clone(), session.clone());
        Self {
            backend,
            media,
            auth,
            session,
            feed,
            reconciler,
        }
    }

    /// Local mode: in-memory tables with snapshot persistence, in-process
    /// media store, self-issued tokens.
    #[cfg(feature = "inmem-backend")]
    pub fn in_memory(config: &Config) -> Result<Self, AppError> {
        use crate::auth::local::LocalAuth;
        use crate::backend::inmem::InMemBackend;
        use crate::storage::mem::MemMediaStore;

        let feed = ChangeFeedHub::new();
        let session = SessionContext::new();
        let backend: Arc<dyn Backend> = Arc::new(InMemBackend::new(feed.clone()));
        let media: Arc<dyn MediaStore> = Arc::new(MemMediaStore::new());
        let auth: Arc<dyn AuthProvider> = Arc::new(LocalAuth::new(
            backend.clone(),
            session.clone(),
            config.jwt_secret.clone(),
        ));
        Ok(Self::from_parts(backend, media, auth, session, feed))
    }

    /// Hosted mode: row API + identity endpoints + S3-compatible storage.
    #[cfg(feature = "rest-backend")]
    pub async fn connect(config: &Config) -> Result<Self, AppError> {
        use crate::auth::rest::RestAuth;
        use crate::backend::rest::RestBackend;
        use crate::storage::S3MediaStore;

        if config.api_key.is_empty() {
            return Err(AppError::Config("FOODIE_API_KEY must be set".into()));
        }
        let feed = ChangeFeedHub::new();
        let session = SessionContext::new();
        let backend: Arc<dyn Backend> =
            Arc::new(RestBackend::new(config, session.clone()).map_err(AppError::from)?);
        let media: Arc<dyn MediaStore> = Arc::new(
            S3MediaStore::new()
                .await
                .map_err(|e| AppError::Config(e.to_string()))?,
        );
        let auth: Arc<dyn AuthProvider> = Arc::new(
            RestAuth::new(config, session.clone())
                .map_err(|e| AppError::Backend(e.to_string()))?,
        );
        Ok(Self::from_parts(backend, media, auth, session, feed))
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn auth(&self) -> &dyn AuthProvider {
        self.auth.as_ref()
    }

    pub fn feed(&self) -> &ChangeFeedHub {
        &self.feed
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn media(&self) -> &Arc<dyn MediaStore> {
        &self.media
    }

    pub fn interactions(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn posts(&self) -> PostService {
        PostService::new(
            self.backend.clone(),
            self.media.clone(),
            self.session.clone(),
            self.feed.clone(),
        )
    }

    pub fn comments(&self) -> CommentService {
        CommentService::new(self.backend.clone(), self.session.clone(), self.feed.clone())
    }

    pub fn profiles(&self) -> ProfileService {
        ProfileService::new(self.backend.clone(), self.media.clone(), self.session.clone())
    }
}
