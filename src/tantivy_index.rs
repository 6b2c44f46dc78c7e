use std::{collections::BTreeMap, path::Path, time::Instant};

use serde::Serialize;
use serde_json::{Map, Value as JsonValue, json};
use tantivy::{
    DateTime as TantivyDateTime,
    Index,
    IndexReader,
    IndexWriter,
    TantivyDocument,
    Term,
    collector::{Count, FacetCollector, TopDocs},
    query::{Query, QueryParser},
    schema::*,
    snippet::SnippetGenerator,
    tokenizer::{
        LowerCaser,
        RemoveLongFilter,
        SimpleTokenizer,
        Stemmer,
        TextAnalyzer,
    },
};

use crate::{
    document::{IndexedSession, Speaker},
    error::{Error, Result},
};

/// Memory budget handed to each batch writer.
pub const WRITER_MEMORY_BUDGET: usize = 50_000_000;

/// Field names used in the schema.
pub mod fields {
    pub const ID: &str = "id";
    pub const TITLE: &str = "title";
    pub const DESCRIPTION: &str = "description";
    pub const URL: &str = "url";
    pub const COLLECTION_TITLE: &str = "collection_title";
    pub const COLLECTION_URL: &str = "collection_url";
    pub const SPEAKER_NAME: &str = "speaker_name";
    pub const SPEAKER_SLUG: &str = "speaker_slug";
    pub const THUMBNAIL_URL: &str = "thumbnail_url";
    pub const RECORDED: &str = "recorded";
    pub const RECORDED_FORMATTED: &str = "recorded_formatted";
    pub const COLLECTION_FACET: &str = "collection_facet";
    pub const SPEAKERS_FACET: &str = "speakers_facet";

    /// Name under which the speaker list is requested and returned.
    pub const SPEAKERS: &str = "speakers";
}

/// A tantivy index holding one document per session.
pub struct SearchIndex {
    index: Index,
    reader: IndexReader,
    fields: SchemaFields,
}

/// Resolved field handles for the schema.
#[derive(Clone, Copy)]
pub struct SchemaFields {
    pub id: Field,
    pub title: Field,
    pub description: Field,
    pub url: Field,
    pub collection_title: Field,
    pub collection_url: Field,
    pub speaker_name: Field,
    pub speaker_slug: Field,
    pub thumbnail_url: Field,
    pub recorded: Field,
    pub recorded_formatted: Field,
    pub collection_facet: Field,
    pub speakers_facet: Field,
}

fn build_schema() -> (Schema, SchemaFields) {
    let mut builder = Schema::builder();

    let text_opts = TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer("en_stem")
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        )
        .set_stored();

    let id = builder.add_text_field(fields::ID, STRING | STORED);
    let title = builder.add_text_field(fields::TITLE, text_opts.clone());
    let description = builder.add_text_field(fields::DESCRIPTION, text_opts);
    let url = builder.add_text_field(fields::URL, STRING | STORED);
    let collection_title =
        builder.add_text_field(fields::COLLECTION_TITLE, STRING | STORED);
    let collection_url =
        builder.add_text_field(fields::COLLECTION_URL, STRING | STORED);
    let speaker_name =
        builder.add_text_field(fields::SPEAKER_NAME, STRING | STORED);
    let speaker_slug =
        builder.add_text_field(fields::SPEAKER_SLUG, STRING | STORED);
    let thumbnail_url =
        builder.add_text_field(fields::THUMBNAIL_URL, STRING | STORED);
    let recorded = builder.add_date_field(
        fields::RECORDED,
        DateOptions::default().set_indexed().set_stored().set_fast(),
    );
    let recorded_formatted =
        builder.add_text_field(fields::RECORDED_FORMATTED, STRING | STORED);
    let collection_facet = builder
        .add_facet_field(fields::COLLECTION_FACET, FacetOptions::default());
    let speakers_facet = builder
        .add_facet_field(fields::SPEAKERS_FACET, FacetOptions::default());

    let schema = builder.build();
    let fields = SchemaFields {
        id,
        title,
        description,
        url,
        collection_title,
        collection_url,
        speaker_name,
        speaker_slug,
        thumbnail_url,
        recorded,
        recorded_formatted,
        collection_facet,
        speakers_facet,
    };

    (schema, fields)
}

fn register_tokenizers(index: &Index) {
    let en_stem = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(Stemmer::new(tantivy::tokenizer::Language::English))
        .build();
    index.tokenizers().register("en_stem", en_stem);
}

/// A set of documents submitted to the index in one commit.
#[derive(Debug, Default)]
pub struct Batch {
    docs: Vec<(String, IndexedSession)>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, id: impl Into<String>, doc: IndexedSession) {
        self.docs.push((id.into(), doc));
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.docs.iter().map(|(id, _)| id.as_str())
    }
}

/// Exclusive write access to a [`SearchIndex`]. Each submitted batch is
/// committed as a unit.
pub struct SessionWriter {
    writer: IndexWriter,
    fields: SchemaFields,
}

impl SessionWriter {
    /// Add every document of `batch` and commit.
    ///
    /// Documents replace any existing document with the same id.
    pub fn submit(&mut self, batch: Batch) -> Result<()> {
        for (id, doc) in batch.docs {
            self.writer
                .delete_term(Term::from_field_text(self.fields.id, &id));
            self.writer
                .add_document(to_tantivy_doc(&self.fields, &id, &doc))
                .map_err(|e| Error::Engine(e.to_string()))?;
        }
        self.writer
            .commit()
            .map_err(|e| Error::Engine(e.to_string()))?;
        Ok(())
    }
}

fn to_tantivy_doc(
    f: &SchemaFields,
    id: &str,
    session: &IndexedSession,
) -> TantivyDocument {
    let mut doc = TantivyDocument::default();
    doc.add_text(f.id, id);
    doc.add_text(f.title, &session.title);
    doc.add_text(f.description, &session.description);
    doc.add_text(f.url, &session.url);
    doc.add_text(f.collection_title, &session.collection_title);
    doc.add_text(f.collection_url, &session.collection_url);
    doc.add_facet(
        f.collection_facet,
        Facet::from_path([session.collection_title.as_str()]),
    );
    for speaker in &session.speakers {
        doc.add_text(f.speaker_name, &speaker.name);
        doc.add_text(f.speaker_slug, &speaker.slug);
        doc.add_facet(
            f.speakers_facet,
            Facet::from_path([speaker.name.as_str()]),
        );
    }
    doc.add_text(f.thumbnail_url, &session.thumbnail_url);
    if let Some(recorded) = session.recorded {
        doc.add_date(
            f.recorded,
            TantivyDateTime::from_timestamp_secs(recorded.timestamp()),
        );
    }
    doc.add_text(f.recorded_formatted, &session.recorded_formatted);
    doc
}

/// A facet to compute alongside a search.
#[derive(Debug, Clone)]
pub struct FacetRequest {
    /// Either `collection_title` or `speakers`.
    pub field: String,
    pub size: usize,
}

/// Parameters of a query against the index.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    /// Stored fields to return per hit. Empty returns all of them.
    pub fields: Vec<String>,
    pub size: usize,
    pub highlight: bool,
    pub facets: BTreeMap<String, FacetRequest>,
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            fields: Vec::new(),
            size: 10,
            highlight: false,
            facets: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResults {
    pub total_hits: usize,
    pub max_score: f32,
    pub hits: Vec<Hit>,
    pub facets: BTreeMap<String, FacetResult>,
    pub took_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Hit {
    pub id: String,
    pub score: f32,
    pub fields: Map<String, JsonValue>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fragments: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FacetResult {
    pub field: String,
    pub total: u64,
    pub terms: Vec<FacetTerm>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FacetTerm {
    pub term: String,
    pub count: u64,
}

impl SearchIndex {
    /// Create a new, empty index in `dir`.
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let (schema, fields) = build_schema();
        let index = Index::create_in_dir(dir, schema)?;
        Self::from_index(index, fields)
    }

    /// Open an existing index in `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        let (_, fields) = build_schema();
        let index = Index::open_in_dir(dir)?;
        Self::from_index(index, fields)
    }

    /// Whether `dir` holds an index.
    pub fn exists(dir: &Path) -> Result<bool> {
        if !dir.is_dir() {
            return Ok(false);
        }
        let mmap_dir = tantivy::directory::MmapDirectory::open(dir)
            .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?;
        Ok(Index::exists(&mmap_dir)
            .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?)
    }

    /// Create an in-memory index. Used before the first build is published
    /// and in tests.
    pub fn open_in_ram() -> Result<Self> {
        let (schema, fields) = build_schema();
        let index = Index::create_in_ram(schema);
        Self::from_index(index, fields)
    }

    fn from_index(index: Index, fields: SchemaFields) -> Result<Self> {
        register_tokenizers(&index);
        let reader = index.reader()?;
        Ok(Self {
            index,
            reader,
            fields,
        })
    }

    /// Take the index's write lock. Only one writer may exist at a time.
    pub fn writer(&self, memory_budget: usize) -> Result<SessionWriter> {
        Ok(SessionWriter {
            writer: self.index.writer(memory_budget)?,
            fields: self.fields,
        })
    }

    /// Number of searchable documents as of the last reload.
    pub fn num_docs(&self) -> Result<u64> {
        self.reader.reload()?;
        Ok(self.reader.searcher().num_docs())
    }

    /// All document ids in the index, sorted.
    pub fn document_ids(&self) -> Result<Vec<String>> {
        self.reader.reload()?;
        let searcher = self.reader.searcher();
        let mut ids = Vec::new();
        for segment_reader in searcher.segment_readers() {
            let store = segment_reader.get_store_reader(1)?;
            for doc_id in segment_reader.doc_ids_alive() {
                let doc: TantivyDocument = store.get(doc_id)?;
                ids.push(extract_text(&doc, self.fields.id));
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Run a query string against `title` and `description`.
    ///
    /// The query is parsed leniently, so syntax errors degrade to the terms
    /// that could be understood. The `title` field is boosted 2x.
    pub fn search(
        &self,
        query_str: &str,
        request: &SearchRequest,
    ) -> Result<SearchResults> {
        let started = Instant::now();
        let f = self.fields;
        self.reader.reload()?;
        let searcher = self.reader.searcher();

        let mut parser =
            QueryParser::for_index(&self.index, vec![f.title, f.description]);
        parser.set_field_boost(f.title, 2.0);
        let (query, _errors) = parser.parse_query_lenient(query_str);

        let (top_docs, total_hits) = searcher.search(
            &query,
            &(TopDocs::with_limit(request.size.max(1)), Count),
        )?;

        let snippets = if request.highlight {
            Some((
                SnippetGenerator::create(&searcher, &*query, f.title)?,
                SnippetGenerator::create(&searcher, &*query, f.description)?,
            ))
        } else {
            None
        };

        let mut hits = Vec::with_capacity(top_docs.len());
        let mut max_score = 0.0f32;
        for (score, doc_address) in top_docs.into_iter().take(request.size) {
            let doc: TantivyDocument = searcher.doc(doc_address)?;
            max_score = max_score.max(score);

            let mut fragments = BTreeMap::new();
            if let Some((title_gen, description_gen)) = &snippets {
                for (name, generator) in [
                    (fields::TITLE, title_gen),
                    (fields::DESCRIPTION, description_gen),
                ] {
                    let html = generator.snippet_from_doc(&doc).to_html();
                    if !html.trim().is_empty() {
                        fragments.insert(name.to_string(), vec![html]);
                    }
                }
            }

            hits.push(Hit {
                id: extract_text(&doc, f.id),
                score,
                fields: stored_fields(&f, &doc, &request.fields),
                fragments,
            });
        }

        let mut facets = BTreeMap::new();
        for (name, facet) in &request.facets {
            facets.insert(
                name.clone(),
                self.facet_counts(&searcher, &*query, facet)?,
            );
        }

        Ok(SearchResults {
            total_hits,
            max_score,
            hits,
            facets,
            took_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn facet_counts(
        &self,
        searcher: &tantivy::Searcher,
        query: &dyn Query,
        request: &FacetRequest,
    ) -> Result<FacetResult> {
        let facet_field = match request.field.as_str() {
            fields::COLLECTION_TITLE => fields::COLLECTION_FACET,
            fields::SPEAKERS => fields::SPEAKERS_FACET,
            other => {
                return Err(
                    tantivy::TantivyError::FieldNotFound(other.to_string())
                        .into(),
                );
            }
        };

        let mut collector = FacetCollector::for_field(facet_field);
        collector.add_facet("/");
        let counts = searcher.search(query, &collector)?;

        let total = counts.get("/").map(|(_, count)| count).sum();
        let terms = counts
            .top_k("/", request.size)
            .into_iter()
            .map(|(facet, count)| FacetTerm {
                term: facet.to_path().join("/"),
                count,
            })
            .collect();

        Ok(FacetResult {
            field: request.field.clone(),
            total,
            terms,
        })
    }
}

impl std::fmt::Debug for SearchIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchIndex").finish_non_exhaustive()
    }
}

/// Rebuild the requested stored fields of a hit as JSON.
fn stored_fields(
    f: &SchemaFields,
    doc: &TantivyDocument,
    wanted: &[String],
) -> Map<String, JsonValue> {
    let include =
        |name: &str| wanted.is_empty() || wanted.iter().any(|w| w == name);
    let mut out = Map::new();

    for (name, field) in [
        (fields::TITLE, f.title),
        (fields::DESCRIPTION, f.description),
        (fields::URL, f.url),
        (fields::COLLECTION_TITLE, f.collection_title),
        (fields::COLLECTION_URL, f.collection_url),
        (fields::THUMBNAIL_URL, f.thumbnail_url),
        (fields::RECORDED_FORMATTED, f.recorded_formatted),
    ] {
        if include(name) {
            out.insert(name.to_string(), json!(extract_text(doc, field)));
        }
    }

    if include(fields::SPEAKERS) {
        let speakers: Vec<Speaker> = extract_all_text(doc, f.speaker_name)
            .into_iter()
            .zip(extract_all_text(doc, f.speaker_slug))
            .map(|(name, slug)| Speaker { name, slug })
            .collect();
        out.insert(fields::SPEAKERS.to_string(), json!(speakers));
    }

    if include(fields::RECORDED) {
        let recorded = doc
            .get_first(f.recorded)
            .and_then(|v| v.as_datetime())
            .and_then(|ts| {
                chrono::DateTime::from_timestamp(ts.into_timestamp_secs(), 0)
            })
            .map(|ts| ts.to_rfc3339());
        out.insert(fields::RECORDED.to_string(), json!(recorded));
    }

    out
}

fn extract_text(doc: &TantivyDocument, field: Field) -> String {
    doc.get_first(field)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn extract_all_text(doc: &TantivyDocument, field: Field) -> Vec<String> {
    doc.get_all(field)
        .filter_map(|v| v.as_str())
        .map(str::to_string)
        .collect()
}
