use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::StoreError;
use crate::models::Article;

/// The run's articles in insertion order, indexed by id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArticleStore {
    articles: Vec<Article>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl ArticleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_articles(articles: Vec<Article>) -> Result<Self, StoreError> {
        let mut store = Self::new();
        for article in articles {
            store.insert(article)?;
        }
        Ok(store)
    }

    pub fn insert(&mut self, article: Article) -> Result<(), StoreError> {
        if self.index.contains_key(&article.id) {
            return Err(StoreError::DuplicateId(article.id));
        }
        self.index.insert(article.id.clone(), self.articles.len());
        self.articles.push(article);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Article> {
        self.index.get(id).map(|&i| &self.articles[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.articles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.articles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Article> {
        self.articles.iter()
    }

    pub fn articles(&self) -> &[Article] {
        &self.articles
    }

    /// Translation fills the normalized fields after insertion; the id and the
    /// original fields stay untouched.
    pub fn set_normalized_text(
        &mut self,
        id: &str,
        title: String,
        excerpt: String,
        degraded: bool,
    ) -> Result<(), StoreError> {
        let i = *self
            .index
            .get(id)
            .ok_or_else(|| StoreError::UnknownArticle(id.to_string()))?;
        let article = &mut self.articles[i];
        article.normalized_title = title;
        article.normalized_excerpt = excerpt;
        article.translation_degraded = degraded;
        Ok(())
    }

    /// Set an article's cluster. Assigning the same cluster again is a no-op;
    /// a different one is an error.
    pub fn assign_cluster(&mut self, id: &str, cluster_id: &str) -> Result<(), StoreError> {
        let i = *self
            .index
            .get(id)
            .ok_or_else(|| StoreError::UnknownArticle(id.to_string()))?;
        let article = &mut self.articles[i];
        match &article.canonical_cluster_id {
            Some(existing) if existing == cluster_id => Ok(()),
            Some(existing) => Err(StoreError::ClusterReassigned {
                id: id.to_string(),
                existing: existing.clone(),
                requested: cluster_id.to_string(),
            }),
            None => {
                article.canonical_cluster_id = Some(cluster_id.to_string());
                Ok(())
            }
        }
    }

    /// Rebuild the id index after deserialization.
    pub fn reindex(&mut self) {
        self.index = self
            .articles
            .iter()
            .enumerate()
            .map(|(i, a)| (a.id.clone(), i))
            .collect();
    }
}
