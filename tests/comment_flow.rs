#![cfg(feature = "inmem-backend")]

use foodie::auth::AuthProvider;
use foodie::models::NewComment;
use foodie::{AppError, Config, Foodie};
use serial_test::serial;
use uuid::Uuid;

fn test_config() -> Config {
    Config {
        api_url: String::new(),
        api_key: String::new(),
        jwt_secret: "test-secret-must-be-32-bytes-long!!".into(),
    }
}

fn client() -> Foodie {
    std::env::set_var("FOODIE_DATA_DIR", tempfile::tempdir().unwrap().path());
    Foodie::in_memory(&test_config()).unwrap()
}

async fn sign_up(c: &Foodie, email: &str, username: &str) -> Uuid {
    c.auth()
        .sign_up(email, "hunter2-hunter2", username)
        .await
        .unwrap()
        .unwrap()
        .user_id
}

#[tokio::test]
#[serial]
async fn threaded_listing_with_authors() {
    let c = client();
    let ada = sign_up(&c, "a@x.dev", "ada").await;
    let post = c.posts().create("dinner", None).await.unwrap();

    let root = c
        .comments()
        .create(NewComment {
            post_id: post.id,
            content: "looks great".into(),
            parent_id: None,
        })
        .await
        .unwrap();
    let reply = c
        .comments()
        .create(NewComment {
            post_id: post.id,
            content: "thanks!".into(),
            parent_id: Some(root.id),
        })
        .await
        .unwrap();
    let second_root = c
        .comments()
        .create(NewComment {
            post_id: post.id,
            content: "recipe?".into(),
            parent_id: None,
        })
        .await
        .unwrap();

    let thread = c.comments().list(post.id).await.unwrap();
    assert_eq!(thread.nodes.len(), 2);
    assert_eq!(thread.nodes[0].comment.id, root.id);
    assert_eq!(thread.nodes[0].replies.len(), 1);
    assert_eq!(thread.nodes[0].replies[0].id, reply.id);
    assert_eq!(thread.nodes[1].comment.id, second_root.id);
    assert!(thread.nodes[1].replies.is_empty());
    assert_eq!(thread.authors.get(&ada).unwrap().username, "ada");
}

#[tokio::test]
#[serial]
async fn reply_parent_must_be_on_the_same_post() {
    let c = client();
    sign_up(&c, "a@x.dev", "ada").await;
    let post_a = c.posts().create("a", None).await.unwrap();
    let post_b = c.posts().create("b", None).await.unwrap();
    let on_a = c
        .comments()
        .create(NewComment {
            post_id: post_a.id,
            content: "root".into(),
            parent_id: None,
        })
        .await
        .unwrap();

    let err = c
        .comments()
        .create(NewComment {
            post_id: post_b.id,
            content: "cross-post reply".into(),
            parent_id: Some(on_a.id),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound));

    // unknown parent is the same condition
    let err = c
        .comments()
        .create(NewComment {
            post_id: post_a.id,
            content: "ghost parent".into(),
            parent_id: Some(Uuid::new_v4()),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound));
}

#[tokio::test]
#[serial]
async fn delete_is_author_only_and_takes_replies() {
    let c = client();
    sign_up(&c, "a@x.dev", "ada").await;
    let post = c.posts().create("dinner", None).await.unwrap();
    let root = c
        .comments()
        .create(NewComment {
            post_id: post.id,
            content: "root".into(),
            parent_id: None,
        })
        .await
        .unwrap();
    c.comments()
        .create(NewComment {
            post_id: post.id,
            content: "reply".into(),
            parent_id: Some(root.id),
        })
        .await
        .unwrap();

    c.auth().sign_out().await.unwrap();
    sign_up(&c, "b@x.dev", "grace").await;
    let err = c.comments().delete(root.id).await.unwrap_err();
    assert!(matches!(err, AppError::Forbidden));

    c.auth().sign_out().await.unwrap();
    c.auth()
        .sign_in("a@x.dev", "hunter2-hunter2")
        .await
        .unwrap();
    c.comments().delete(root.id).await.unwrap();

    let thread = c.comments().list(post.id).await.unwrap();
    assert!(thread.nodes.is_empty());
}

#[tokio::test]
#[serial]
async fn watch_fires_for_its_post_only() {
    let c = client();
    sign_up(&c, "a@x.dev", "ada").await;
    let watched = c.posts().create("watched", None).await.unwrap();
    let noisy = c.posts().create("noisy", None).await.unwrap();

    let mut sub = c.comments().watch(watched.id);
    c.comments()
        .create(NewComment {
            post_id: noisy.id,
            content: "elsewhere".into(),
            parent_id: None,
        })
        .await
        .unwrap();
    let here = c
        .comments()
        .create(NewComment {
            post_id: watched.id,
            content: "here".into(),
            parent_id: None,
        })
        .await
        .unwrap();

    let ev = sub.next().await.unwrap();
    assert_eq!(ev.row["id"], serde_json::json!(here.id));
}
