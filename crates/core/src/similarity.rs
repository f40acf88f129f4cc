use crate::error::RetrievalError;
use crate::models::Fragment;

pub const DEFAULT_TOP_K: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct RankedFragment<'a> {
    pub fragment: &'a Fragment,
    pub score: f64,
}

/// Cosine similarity accumulated in `f64`.
///
/// Returns 0.0 when either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f64, RetrievalError> {
    if a.len() != b.len() {
        return Err(RetrievalError::DimensionMismatch {
            expected: a.len(),
            found: b.len(),
        });
    }

    let (mut dot, mut norm_a, mut norm_b) = (0f64, 0f64, 0f64);
    for (left, right) in a.iter().zip(b) {
        let (left, right) = (f64::from(*left), f64::from(*right));
        dot += left * right;
        norm_a += left * left;
        norm_b += right * right;
    }

    let denominator = norm_a.sqrt() * norm_b.sqrt();
    if denominator > 0.0 {
        Ok(dot / denominator)
    } else {
        Ok(0.0)
    }
}

/// Scores every embedded fragment against `query` and sorts by descending score.
///
/// Fragments without an embedding are skipped. Equal scores keep input order.
pub fn rank<'a>(
    query: &[f32],
    fragments: &'a [Fragment],
) -> Result<Vec<RankedFragment<'a>>, RetrievalError> {
    let mut ranked = fragments
        .iter()
        .filter_map(|fragment| {
            fragment.embedding.as_deref().map(|embedding| {
                cosine_similarity(query, embedding).map(|score| RankedFragment { fragment, score })
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    ranked.sort_by(|left, right| right.score.total_cmp(&left.score));
    Ok(ranked)
}

pub fn top_k<'a>(
    query: &[f32],
    fragments: &'a [Fragment],
    k: usize,
) -> Result<Vec<RankedFragment<'a>>, RetrievalError> {
    let mut ranked = rank(query, fragments)?;
    ranked.truncate(k);
    Ok(ranked)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(text: &str, embedding: &[f32]) -> Fragment {
        Fragment::embedded(text, embedding.to_vec())
    }

    #[test]
    fn identical_vector_ranks_first() -> Result<(), RetrievalError> {
        let query = [0.2, 0.4, 0.1, 0.9];
        let fragments = vec![
            fragment("near", &[0.2, 0.5, 0.1, 0.8]),
            fragment("far", &[-0.9, 0.1, 0.3, 0.0]),
            fragment("self", &query),
        ];

        let ranked = rank(&query, &fragments)?;
        assert_eq!(ranked[0].fragment.text, "self");
        assert!((ranked[0].score - 1.0).abs() < 1e-9);
        assert_eq!(ranked[2].fragment.text, "far");
        Ok(())
    }

    #[test]
    fn cosine_is_symmetric() -> Result<(), RetrievalError> {
        let a = [0.3, -0.7, 0.25, 0.1];
        let b = [0.9, 0.05, -0.4, 0.6];
        assert_eq!(cosine_similarity(&a, &b)?, cosine_similarity(&b, &a)?);
        Ok(())
    }

    #[test]
    fn zero_vectors_score_zero_not_nan() -> Result<(), RetrievalError> {
        let score = cosine_similarity(&[0.0, 0.0], &[1.0, 2.0])?;
        assert_eq!(score, 0.0);
        Ok(())
    }

    #[test]
    fn dimension_mismatch_is_an_error() {
        let fragments = vec![fragment("short", &[1.0, 0.0])];
        let result = rank(&[1.0, 0.0, 0.0], &fragments);
        assert!(matches!(
            result,
            Err(RetrievalError::DimensionMismatch {
                expected: 3,
                found: 2
            })
        ));
    }

    #[test]
    fn ties_keep_input_order() -> Result<(), RetrievalError> {
        let fragments = vec![
            fragment("first", &[1.0, 0.0]),
            fragment("second", &[2.0, 0.0]),
            fragment("third", &[3.0, 0.0]),
        ];
        let ranked = rank(&[1.0, 0.0], &fragments)?;
        let order: Vec<_> = ranked.iter().map(|hit| hit.fragment.text.as_str()).collect();
        assert_eq!(order, vec!["first", "second", "third"]);
        Ok(())
    }

    #[test]
    fn top_k_returns_all_when_fewer_fragments() -> Result<(), RetrievalError> {
        let fragments = vec![fragment("a", &[1.0, 0.0]), fragment("b", &[0.0, 1.0])];
        assert_eq!(top_k(&[1.0, 0.0], &fragments, DEFAULT_TOP_K)?.len(), 2);

        let many: Vec<_> = (0..6)
            .map(|index| fragment("x", &[1.0, index as f32]))
            .collect();
        let hits = top_k(&[1.0, 0.0], &many, DEFAULT_TOP_K)?;
        assert_eq!(hits.len(), 3);
        assert!(hits[0].score >= hits[1].score && hits[1].score >= hits[2].score);
        Ok(())
    }

    #[test]
    fn unembedded_fragments_are_skipped() -> Result<(), RetrievalError> {
        let fragments = vec![Fragment::new("text only"), fragment("vec", &[1.0])];
        let ranked = rank(&[1.0], &fragments)?;
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].fragment.text, "vec");
        Ok(())
    }
}
